use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use mfa_relay::config::Config;
use mfa_relay::filter::{Pipeline, Stage};
use mfa_relay::mail::Mail;
use mfa_relay::outcome::Halt;
use mfa_relay::supervisor::{self, ipc, IpcServer, PidFile, ProcessLauncher, Supervisor};
use mfa_relay::worker::{self, Worker};
use std::process;
use std::sync::Arc;
use tokio::net::TcpListener;

fn main() {
    let matches = Command::new("mfa-relay")
        .version(env!("CARGO_PKG_VERSION"))
        .about("SMTP filtering relay with virus and spam scanning")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mfa-relay.yaml")
                .global(true),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test configuration validity")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Run an email file through the filter pipeline")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .subcommand(Command::new("start").about("Start the relay (default)"))
        .subcommand(Command::new("stop").about("Stop a running relay"))
        .subcommand(
            Command::new("worker")
                .about("Serve SMTP sessions over stdin/stdout")
                .hide(true),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| "/etc/mfa-relay.yaml".to_string());

    // Workers log to a file; stdout and stderr belong to the supervisor.
    if let Some(("worker", _)) = matches.subcommand() {
        let result = load_config(&config_path).and_then(|config| run_worker(config, log_level));
        if let Err(e) = result {
            eprintln!("Worker error: {e:#}");
            process::exit(1);
        }
        return;
    }

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        if let Err(e) = block_on(test_email_file(config, email_file)) {
            eprintln!("Error testing email: {e:#}");
            process::exit(1);
        }
        return;
    }

    let result = match matches.subcommand() {
        Some(("stop", _)) => stop(&config),
        _ => start(config, &config_path, &matches),
    };
    if let Err(e) = result {
        log::error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(future),
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            process::exit(1);
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path).with_context(|| format!("reading {path}"))
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("Testing configuration...");
    println!("Listening on: {}", config.relay.ports.join(", "));
    println!("Default relay: {}", config.relay.default_relay);
    println!(
        "ClamAV: {}",
        config
            .scanners
            .clamav
            .as_ref()
            .map_or("disabled", |c| c.socket.as_str())
    );
    println!(
        "SpamAssassin: {}",
        config
            .scanners
            .spamassassin
            .as_ref()
            .map_or("disabled", |c| c.socket.as_str())
    );
    println!("Number of rules: {}", config.rules.len());
    for (i, rule) in config.rules.iter().enumerate() {
        println!("  Rule {}: {} ({})", i + 1, rule.name, rule.stage);
    }

    match config.validate() {
        Ok(()) => println!("Configuration is valid."),
        Err(e) => {
            println!("Configuration validation failed:");
            println!("Error: {e:#}");
            process::exit(1);
        }
    }
}

/// Runs a message file through the envelope and data stages as if it had
/// arrived over SMTP.
async fn test_email_file(config: Config, email_file: &str) -> anyhow::Result<()> {
    let raw = std::fs::read(email_file).with_context(|| format!("reading {email_file}"))?;
    let pipeline = Pipeline::from_config(&config)?;
    let mut mail = Mail::from_raw(&raw, config.relay.unfold_headers);

    let sender = mail
        .headers()
        .first("return-path")
        .or_else(|| mail.headers().first("from"))
        .map(|value| match (value.rfind('<'), value.rfind('>')) {
            (Some(start), Some(end)) if start < end => value[start + 1..end].to_string(),
            _ => value.trim().to_string(),
        })
        .unwrap_or_else(|| "unknown@example.com".to_string());
    mail.set_helo("localhost");
    mail.set_sender(sender);
    mail.add_recipient("test@example.com");

    println!("Testing email file: {email_file}");
    println!("   Sender: {}", mail.sender());
    if let Some(subject) = mail.headers().first("subject") {
        println!("   Subject: {subject}");
    }
    println!("   Body parts: {}", mail.body_parts().len());

    for stage in [Stage::Helo, Stage::MailFrom, Stage::RcptTo, Stage::Data] {
        match pipeline.run(stage, &mut mail).await {
            Ok(()) => {}
            Err(Halt::Outcome(outcome)) => {
                println!("Outcome at {stage}: {outcome}");
                mail.set_final_destination(outcome.kind().destination());
                break;
            }
            Err(Halt::Failed(e)) => {
                println!("Filter failure at {stage}: {e:#}");
                break;
            }
        }
    }
    println!("Final destination: {}", mail.final_destination());
    println!("{}", mail.to_json()?);
    Ok(())
}

fn run_worker(config: Config, level: LevelFilter) -> anyhow::Result<()> {
    worker::init_logging(&config, level)?;
    // The supervisor decides when workers stop.
    ctrlc::set_handler(|| log::debug!("Ignoring interrupt"))?;
    log::info!("Worker {} started", process::id());
    block_on(async { Worker::new(config)?.run().await })
}

fn stop(config: &Config) -> anyhow::Result<()> {
    let socket = supervisor::socket_path(config);
    let echo = block_on(ipc::send(&socket, "QUIT"))
        .with_context(|| format!("Server is not running ({})", socket.display()))?;
    println!("Stop requested ({echo})");
    Ok(())
}

fn start(config: Config, config_path: &str, matches: &ArgMatches) -> anyhow::Result<()> {
    config.validate()?;
    let pid_path = supervisor::pid_path(&config);
    if pid_path.exists() {
        anyhow::bail!(
            "Server is already running (PID file {} exists)",
            pid_path.display()
        );
    }

    // Workers re-read the configuration after the daemon has left the
    // working directory.
    let config_path = std::fs::canonicalize(config_path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| config_path.to_string());

    if matches.get_flag("daemon") {
        daemonize();
    }

    log::info!("Starting {}...", config.app.name);
    let _pid = PidFile::create(&pid_path)?;
    log::info!("PID file written: {}", pid_path.display());

    let launcher = ProcessLauncher::new(&config_path, matches.get_flag("verbose"))?;
    let config = Arc::new(config);
    block_on(async move {
        let mut listeners = Vec::new();
        for addr in config.listen_addrs()? {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding {addr}"))?;
            log::info!("Listening on {addr}");
            listeners.push(listener);
        }
        let control = IpcServer::bind(&supervisor::socket_path(&config))?;
        Supervisor::new(config, launcher).run(listeners, control).await
    })
}

#[cfg(unix)]
fn daemonize() {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    log::info!("Starting in daemon mode...");

    // First fork
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to fork process");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        log::error!("Failed to create new session");
        process::exit(1);
    }

    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork so the daemon can never reacquire a controlling terminal
    match unsafe { libc::fork() } {
        -1 => {
            log::error!("Failed to second fork");
            process::exit(1);
        }
        0 => {}
        _ => process::exit(0),
    }

    if unsafe { libc::chdir(c"/".as_ptr()) } == -1 {
        log::warn!("Failed to change working directory to /");
    }

    unsafe {
        libc::umask(0o022);
    }

    if let Ok(dev_null) = OpenOptions::new().read(true).write(true).open("/dev/null") {
        let null_fd = dev_null.as_raw_fd();
        unsafe {
            libc::dup2(null_fd, 0);
            libc::dup2(null_fd, 1);
            libc::dup2(null_fd, 2);
        }
        std::mem::forget(dev_null);
    } else {
        log::warn!("Failed to open /dev/null, closing standard file descriptors");
        unsafe {
            libc::close(0);
            libc::close(1);
            libc::close(2);
        }
    }

    log::info!("Daemon mode initialization complete");
}

#[cfg(not(unix))]
fn daemonize() {
    log::warn!("Daemon mode not supported on this platform, running in foreground");
}
