use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;

use boxsync::{Args, OutputFormat, fake_clients, real_clients, run};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let mut stdout = std::io::stdout();

    let run_result = async {
        let fallback_format = if stdout.is_terminal() {
            OutputFormat::Pretty
        } else {
            OutputFormat::Json
        };
        let options = args.run_options(fallback_format);
        let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
        let clients = match maybe_fake_args {
            Some(fake_args) => fake_clients(fake_args),
            None => real_clients().await?,
        };

        run(command, &options, &mut stdout, clients).await
    }
    .await;

    match run_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
