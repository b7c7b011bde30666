// src/main.rs

use qik::{cli, logging, run};

#[tokio::main]
async fn main() {
    let args = cli::parse();

    if let Err(err) = logging::init_logging(args.verbosity) {
        eprintln!("qik: could not initialise logging: {err}");
        std::process::exit(3);
    }

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!(
                "qik: {err} (https://qik.build/errors/#{})",
                err.code()
            );
            std::process::exit(err.exit_code());
        }
    }
}
