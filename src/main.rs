use aproxy::app;

fn main() {
    let args = app::parse();

    let config = match app::init_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Config error: {err}");
            std::process::exit(exitcode::CONFIG);
        }
    };

    if args.test_config {
        println!("Config file {:?} is ok", args.config_file);
        std::process::exit(exitcode::OK);
    }

    app::init_logging(&args, &config);

    if let Err(err) = app::run_server(args, config) {
        eprintln!("Server error: {err}");
        std::process::exit(exitcode::SOFTWARE);
    }
}
