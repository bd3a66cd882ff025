use pg_warden::app;
use pg_warden::config;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn main() {
    let args = app::parse();

    // Config parsing is async (it reads the side files too); run it on a
    // throwaway runtime before the real one is sized from the config.
    let bootstrap = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("bootstrap runtime");

    if let Err(err) = bootstrap.block_on(config::parse(&args.config_file)) {
        eprintln!("Configuration error: {err}");
        std::process::exit(exitcode::CONFIG);
    }
    drop(bootstrap);

    if args.test_config {
        println!("Configuration {} is valid", args.config_file);
        std::process::exit(exitcode::OK);
    }

    let config = config::get_config();

    if let Err(err) = app::init_logging(&args, &config) {
        eprintln!("Logging error: {err}");
        std::process::exit(exitcode::OSERR);
    }

    if let Err(err) = app::run_server(args, config) {
        log::error!("Server error: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }

    std::process::exit(exitcode::OK);
}
