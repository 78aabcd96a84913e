use std::{path::Path, sync::Arc};

use chrono::Utc;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use portico::{
    Message, Server,
    config::{ServiceConfig, ServiceConfigValidator, load_config},
    tracing_setup,
    utils::GracefulShutdown,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
    /// Start the server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    // Determine the command to run
    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config), // Default to serve with config from args
    };

    match command {
        "validate" => {
            return validate_config_command(&config_path);
        }
        "init" => {
            return init_config_command(&config_path).await;
        }
        "serve" => {
            // Continue with normal server startup
        }
        _ => unreachable!(),
    }

    // A missing config file is not fatal: every field has a default, so the
    // server still comes up on the default port.
    let config = if Path::new(&config_path).exists() {
        let config = load_config(&config_path)
            .with_context(|| format!("Failed to load configuration from {config_path}"))?;
        ServiceConfigValidator::validate(&config)
            .map_err(|e| eyre!("Configuration {config_path} is invalid:\n{e}"))?;
        Some(config)
    } else {
        None
    };
    let started_with_defaults = config.is_none();
    let config = config.unwrap_or_default();

    tracing_setup::init_from_config(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    if started_with_defaults {
        tracing::warn!(
            "Configuration file {config_path} not found, starting with built-in defaults"
        );
    }

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            This can happen if a provider was already installed. \
            The application will proceed; ensure a crypto provider is effectively available.",
            e
        );
    } else {
        tracing::info!("Successfully installed aws-lc-rs as the default crypto provider.");
    }

    let server = Arc::new(Server::new(config));

    server.get("/status", || async {
        Message::data(serde_json::json!({
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "time": Utc::now().to_rfc3339(),
        }))
    });

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    {
        let graceful_shutdown = graceful_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = graceful_shutdown.run_signal_handler().await {
                tracing::error!("Signal handler error: {}", e);
            }
        });
    }

    let serving_server = server.clone();
    let mut serving = tokio::spawn(async move { serving_server.run().await });

    let server_result = tokio::select! {
        result = &mut serving => {
            // The server stopped on its own, successfully or not. Still run
            // the shutdown path so responders and workers are released.
            let outcome = result.map_err(|e| eyre!("serving task failed: {e}"))?;
            if let Err(e) = server.close().await {
                tracing::warn!("Cleanup after server exit failed: {:#}", e);
            }
            outcome
        },
        reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}", reason);
            server.close().await?;
            let outcome = serving.await.map_err(|e| eyre!("serving task failed: {e}"))?;
            tracing::info!("Graceful shutdown completed");
            outcome
        }
    };

    server_result?;

    // Shutdown tracing on exit
    tracing_setup::shutdown_tracing();

    Ok(())
}

/// Validate a configuration file and print what the server would do with it
fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    // First check if file exists and is readable
    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    // Try to parse the configuration
    let config: ServiceConfig = match load_config(config_path) {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    // Validate the configuration
    match ServiceConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Root port: {}", config.server.port);
            println!("   • Additional listeners: {}", config.listeners.len());
            let tls_ports: Vec<u16> = std::iter::once(&config.server)
                .chain(config.listeners.iter())
                .filter(|listener| listener.ssl_enabled())
                .map(|listener| listener.port)
                .collect();
            println!("   • TLS ports: {tls_ports:?}");
            let directory = match (&config.acme.directory, config.acme.production) {
                (Some(url), _) => url.clone(),
                (None, true) => "Let's Encrypt production".to_string(),
                (None, false) => "Let's Encrypt staging".to_string(),
            };
            println!("   • ACME directory: {directory}");
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Every port must be unique and greater than 0");
            println!("   • Static roots and 404 pages must exist on disk");
            println!("   • TLS listeners need at least one domain-shaped host");
            println!("   • acme.contact must be an e-mail address");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Portico service configuration

server:
  port: 9009
  # Static file roots probed in declaration order by the catch-all route:
  # locations:
  #   - "web/public"
  # Page served to browsers when nothing matches:
  # page404: "web/404.html"

# Additional listeners beyond the root one:
# listeners:
#   - port: 443
#     ssl:
#       enabled: true
#       hosts:
#         - "app.example.com"

# ACME account settings shared by every TLS listener. Staging issues
# untrusted certificates but has far higher rate limits.
acme:
  # contact: "ops@example.com"
  production: false
  cache_dir: "certs"

logging:
  level: "info"
  format: "text"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'portico serve --config {config_path}' to start the server");
    Ok(())
}
