use forecourt::ServerConfig;
use forecourt::server::Server;
use std::io::Read;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    match args[1].as_str() {
        "check-config" => cmd_check_config(&args[2..]),
        "run" => cmd_run(&args[2..]),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

fn cmd_check_config(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    println!("[sql]");
    println!("thread_pool_size={}", config.sql.thread_pool_size);
    println!("lazy_worker={}", config.sql.lazy_worker);
    println!("[ipc_endpoint]");
    println!("database_name={}", config.ipc_endpoint.database_name);
    println!("threads={}", config.ipc_endpoint.threads);
    println!("admin_sessions={}", config.ipc_endpoint.admin_sessions);
    println!("[stream_endpoint]");
    println!("port={}", config.stream_endpoint.port);
    println!("threads={}", config.stream_endpoint.threads);
    println!("[fdw]");
    println!("name={}", config.fdw.name);
    println!("threads={}", config.fdw.threads);
    println!("[data_store]");
    println!("log_location={}", config.data_store.log_location);
    Ok(())
}

fn cmd_run(args: &[String]) -> Result<(), String> {
    let config = load_config(args)?;
    let server = Server::new(config).map_err(|e| e.to_string())?;
    server.add_ipc_endpoint();
    server.add_stream_endpoint();
    server.start().map_err(|e| e.to_string())?;
    eprintln!("forecourt running; close stdin to stop");
    let mut sink = Vec::new();
    let _ = std::io::stdin().read_to_end(&mut sink);
    server.shutdown().map_err(|e| e.to_string())?;
    Ok(())
}

fn load_config(args: &[String]) -> Result<ServerConfig, String> {
    match parse_flag_value(args, "--conf") {
        Some(path) => ServerConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(ServerConfig::default()),
    }
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

fn print_usage() {
    eprintln!("usage: forecourt <command> [options]");
    eprintln!("  check-config [--conf <path>]   print the effective configuration");
    eprintln!("  run [--conf <path>]            start the server endpoints");
}
