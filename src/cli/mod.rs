mod cluster;
mod enqueue;
mod run;
mod worker;

pub use cluster::*;
pub use enqueue::*;
pub use run::*;
pub use worker::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
