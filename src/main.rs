fn main() {
    use clap::Parser;
    use std::error::Error;
    let args = novelscrape::cli::Args::parse();
    if let Err(e) = novelscrape::logging::init(args.verbose, args.quiet) {
        eprintln!("{:#}", e);
    }
    if let Err(e) = novelscrape::cli::run(&args) {
        eprintln!("{}", e);
        if args.verbose {
            let mut source = e.source();
            while let Some(s) = source {
                eprintln!("  cause: {}", s);
                source = s.source();
            }
        }
        std::process::exit(e.exit_code());
    }
}
