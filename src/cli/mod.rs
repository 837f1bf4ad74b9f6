pub mod args;

use clap::Parser;

pub use args::{Arguments, ChimeraMethod, PoolingMode, SampleErrorPolicy};

pub fn parse() -> Arguments {
    Arguments::parse()
}
