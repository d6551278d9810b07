pub mod rng;
pub mod video_io;
