mod asm;
mod kernel;
mod multiprocess;
mod processor;
mod snapshot;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
