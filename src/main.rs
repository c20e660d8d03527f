fn main() {
    let args = std::env::args();
    // Initialize logging as early as possible; fallback to stderr on failure.
    let _ = pgdelta::logging::init_logging(pgdelta::logging::LogFormat::Human);

    if let Err(err) = pgdelta::run(args) {
        eprintln!("pgdelta error: {err:#}");
        std::process::exit(1);
    }
}
