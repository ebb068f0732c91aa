// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use wsconnect::{util, ClientConfig};

use util::validators::{
  parse_millis, parse_ws_uri, validate_existing_file, validate_millis, validate_ws_uri,
};

mod client;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("wsconnect=debug,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("connect")
        .alias("-c")
        .about("Open a websocket session, send messages, and close it")
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .validator(validate_ws_uri)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("message")
            .help("Text message to send once connected; may be repeated")
            .long("message")
            .short('m')
            .takes_value(true)
            .multiple_occurrences(true),
        )
        .arg(
          Arg::new("subprotocol")
            .long("subprotocol")
            .short('p')
            .takes_value(true)
            .multiple_occurrences(true),
        )
        .arg(
          Arg::new("timeout")
            .help("Milliseconds to wait for the connect to resolve")
            .long("timeout")
            .validator(validate_millis)
            .takes_value(true),
        )
        .arg(
          Arg::new("cancel-after")
            .help("Milliseconds after which the connect is cancelled, if still pending")
            .long("cancel-after")
            .validator(validate_millis)
            .takes_value(true),
        )
        .arg(
          Arg::new("connect-timeout")
            .help("Milliseconds allowed for establishing the transport; 0 for no bound")
            .long("connect-timeout")
            .validator(validate_millis)
            .takes_value(true),
        )
        .arg(
          Arg::new("config")
            .help("JSON client configuration; flags override its values")
            .long("config")
            .validator(validate_existing_file)
            .takes_value(true),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn load_config(args: &'_ ArgMatches) -> Result<ClientConfig> {
  let mut config = match args.value_of("config") {
    Some(path) => {
      let raw = std::fs::read(path).with_context(|| format!("Failed reading {}", path))?;
      ClientConfig::from_json(&raw).context("Invalid client configuration")?
    }
    None => ClientConfig::default(),
  };
  if let Some(ms) = args.value_of("connect-timeout") {
    config.connect_timeout_ms = parse_millis(ms)?.as_millis() as u64;
  }
  Ok(config)
}

pub async fn connect_arg_handling(args: &'_ ArgMatches) -> Result<client::ConnectArgs> {
  let strings = |name: &str| -> Vec<String> {
    args
      .values_of(name)
      .map(|values| values.map(String::from).collect())
      .unwrap_or_default()
  };
  Ok(client::ConnectArgs {
    target: parse_ws_uri(args.value_of("target").expect("Target is required"))?,
    messages: strings("message"),
    timeout: args.value_of("timeout").map(parse_millis).transpose()?,
    cancel_after: args.value_of("cancel-after").map(parse_millis).transpose()?,
    subprotocols: strings("subprotocol"),
    config: load_config(args)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("connect", opts) => {
      let config = connect_arg_handling(opts).await?;
      tracing::info!("Connecting with config {:#?}", config);
      client::connect_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
