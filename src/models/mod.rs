pub mod humo;
