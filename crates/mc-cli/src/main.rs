use clap::Parser;

use mc_cli::{run, Cli};

#[tokio::main]
async fn main() {
    // Buffered log lines must survive even a panic path.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        mc_core::logging::flush_output_streams();
        default_panic(info);
    }));

    let cli = Cli::parse();
    let code = run(cli).await;
    mc_core::logging::flush_output_streams();
    std::process::exit(code.as_i32());
}
