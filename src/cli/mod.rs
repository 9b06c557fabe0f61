mod ask;
mod root;
mod schema;
mod serve;

pub use root::Cli;
