use clap::{App, Arg};
use lumen::logging;
use pulsar::http::server::{HttpServer, ServerConfig, DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY};
use pulsar::tls::rustls::TlsConfig;
use serde_derive::Deserialize;
use sloggers::LoggerConfig;
use std::net::SocketAddr;
use std::process;

#[derive(Deserialize)]
struct Config {
    server: ServerSection,
    #[serde(default)]
    tls: Option<TlsSection>,
    #[serde(default)]
    logging: Option<LoggerConfig>,
}

#[derive(Deserialize)]
struct ServerSection {
    address: String,
    #[serde(default = "default_buffer_size")]
    buffer_size: usize,
    #[serde(default = "default_pool_capacity")]
    pool_capacity: usize,
}

#[derive(Deserialize)]
struct TlsSection {
    certificate: String,
    private_key: String,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

pub fn main() {
    let matches = App::new("Pulsar HTTP Server")
        .version("0.1")
        .about("Runs the event-driven HTTP server.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config: Config = match serdeconv::from_toml_file(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error reading config file: {}", err);
            process::exit(1);
        }
    };

    let logger = match &config.logging {
        Some(section) => logging::from_config(section).expect("Error building logger"),
        None => logging::init(),
    };

    let address: SocketAddr = config
        .server
        .address
        .parse()
        .expect("Invalid listen address");

    let mut server_config = ServerConfig::new(address);
    server_config.buffer_size = config.server.buffer_size;
    server_config.pool_capacity = config.server.pool_capacity;

    if let Some(tls) = &config.tls {
        let tls_config = TlsConfig::from_pem_files(&tls.certificate, &tls.private_key)
            .expect("Error loading TLS certificate material");
        server_config.tls = Some(tls_config);
    }

    let server = HttpServer::new(server_config, &logger).expect("Error starting server");

    server.route("/", |_request, writer| {
        writer.write_str("pulsar is running\n");
    });
    server.route("/echo", |request, writer| {
        writer.write(&request.body);
    });

    logging::info!(logger, "serving"; "address" => %server.local_addr());

    if let Err(err) = server.run() {
        logging::error!(logger, "server terminated"; "error" => %err);
        process::exit(1);
    }
}
