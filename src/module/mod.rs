pub mod killfeed;
