use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use portway::{
    GatewayServer,
    config::{
        ConfigFormat, ConfigurationValidator, load_configuration, load_settings,
        loader::encode_configuration,
        models::{Configuration, RouteNode, Server, ServiceRoute},
    },
    tracing_setup,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "portway.yaml")]
    config: PathBuf,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Start the gateway (default)
    Serve {
        /// Static gateway settings
        #[clap(short, long, default_value = "portway.yaml")]
        config: PathBuf,
    },
    /// Validate a dynamic configuration file or directory
    Validate {
        #[clap(short, long, default_value = "dynamic.yaml")]
        config: PathBuf,
    },
    /// Write a sample dynamic configuration
    Init {
        #[clap(short, long, default_value = "dynamic.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_command(&config),
        Some(Commands::Init { output }) => init_command(&output).await,
        Some(Commands::Serve { config }) => serve_command(&config).await,
        None => serve_command(&args.config).await,
    }
}

async fn serve_command(settings_path: &Path) -> Result<()> {
    let settings = load_settings(settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    tracing_setup::init_tracing(&settings.log)?;

    tracing::info!(
        settings = %settings_path.display(),
        address = %settings.entrypoint.address,
        "Starting portway"
    );
    let server = GatewayServer::builder(settings).build().await?;
    server.run().await
}

fn validate_command(path: &Path) -> Result<()> {
    println!("Validating dynamic configuration: {}", path.display());

    let config = match load_configuration(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration parsing failed: {e:?}");
            std::process::exit(1);
        }
    };

    match ConfigurationValidator::validate(&config) {
        Ok(()) => {
            let routes: usize = config.services.values().map(|s| s.routers.len()).sum();
            println!("Configuration is valid");
            println!("  services:          {}", config.services.len());
            println!("  routes:            {routes}");
            println!("  global middleware: {:?}", config.global_middleware);
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

async fn init_command(output: &Path) -> Result<()> {
    if output.exists() {
        eprintln!("Error: '{}' already exists", output.display());
        std::process::exit(1);
    }
    let format = ConfigFormat::from_path(output).unwrap_or(ConfigFormat::Yaml);
    let contents = encode_configuration(&sample_configuration(), format)?;

    tokio::fs::write(output, contents)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Created sample configuration at {}", output.display());
    Ok(())
}

fn sample_configuration() -> Configuration {
    Configuration::builder()
        .balance_mode("roundRobin")
        .global_middleware(["recovery", "errorhandler", "requestid", "logging"])
        .service(
            "orders",
            ServiceRoute::new()
                .with_route(RouteNode::new("/orders").with_methods(["GET", "POST"]))
                .with_route(
                    RouteNode::new("/orders/:id")
                        .with_param("id", "[0-9]+")
                        .with_methods(["GET"]),
                )
                .with_server(Server::new("127.0.0.1", 9001))
                .with_server(Server::new("127.0.0.1", 9002)),
        )
        .service(
            "users",
            ServiceRoute::new()
                .with_balance_mode("ipHash")
                .with_middleware("securityheaders")
                .with_route(RouteNode::subrouter(
                    "/users",
                    vec![
                        RouteNode::new("/").with_methods(["*"]),
                        RouteNode::new("/*").with_proxy_path("/v1/*"),
                    ],
                ))
                .with_server(Server::new("127.0.0.1", 9101)),
        )
        .build()
}
