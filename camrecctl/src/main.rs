use clap::Parser;

fn main() {
    let cli = camrecctl::Cli::parse();
    if let Err(err) = camrecctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
