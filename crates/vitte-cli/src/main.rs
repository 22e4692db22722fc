//! Entry point for the `vitte` binary. Sets up error reporting and logging,
//! then delegates to `vitte_cli::run`.

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("could not install color-eyre: {e}");
    }
    env_logger::init();

    if let Err(err) = vitte_cli::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
