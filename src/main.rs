//! Deployify - 源码到公网地址的部署代理
//!
//! Usage:
//! - Normal mode: `deployify`
//! - With custom port: `deployify --port 19999`

use deployify::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                if config.port_override.is_none() {
                    eprintln!("Ignoring invalid --port value: {}", args[i + 1]);
                }
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("Ignoring unknown argument: {}", other);
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Deployify - 源码到公网地址的部署代理");
    println!();
    println!("USAGE:");
    println!("    deployify [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    DEPLOYIFY_API_KEY        API key required by mutating endpoints");
    println!("    DEPLOYIFY_PORT_RANGE     Host port range, e.g. 30000-40000");
    println!("    DEPLOYIFY_BUILD_ROOT     Directory for build contexts");
    println!("    TUNNEL_API_KEY           Tunnel control-plane API key");
    println!("    TUNNEL_AUTHTOKEN         Auth token written into the agent config");
    println!("    RUST_LOG                 Log filter (default: info)");
}

fn main() {
    let config = parse_args();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(deployify::init_and_run_with_config(config)) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
