use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use dnsburst::cli::Cli;
use dnsburst::supervisor;

fn init_tracing(verbosity: u8) {
	let level = match verbosity {
		0 => LevelFilter::OFF,
		1 => LevelFilter::INFO,
		2 => LevelFilter::DEBUG,
		_ => LevelFilter::TRACE,
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_tracing(cli.verbosity);

	// the whole engine runs on this one thread
	let local = tokio::task::LocalSet::new();
	local.run_until(supervisor::run(cli)).await
}
