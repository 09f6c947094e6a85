use clap::Parser;

use memtrace::config::Args;
use memtrace::Tracer;

fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(err) = Tracer::run(args) {
        eprintln!("memtrace: {:#}", err);
        std::process::exit(1);
    }
}
