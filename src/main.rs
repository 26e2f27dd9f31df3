//! lu-runner - compile-and-run service with interactive sandboxed sessions.
//!
//! Usage:
//!   lu-runner serve [--port 8080]              # Start HTTP + websocket server
//!   lu-runner run main.c [-- args...]          # One-shot run against the terminal

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use lu_runner::bridge::{Frame, Transport};
use lu_runner::config::{default_scratch_root, Config, Isolation, Limits, Toolchain};
use lu_runner::{http_server, AppState, Language, Pipeline, SessionRegistry, Submission, Terminal};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lu-runner", version)]
#[command(about = "Compile-and-run service with sandboxed interactive sessions")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Build and run one source file, attached to this terminal
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "HOST", default_value = "localhost")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Origin allowed to call the API from a browser
    #[arg(long, env = "FRONTEND_URL")]
    frontend_url: Option<String>,

    #[command(flatten)]
    sandbox: SandboxArgs,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Source file to run
    file: PathBuf,

    #[arg(long, value_enum, default_value = "c")]
    language: LanguageArg,

    #[command(flatten)]
    sandbox: SandboxArgs,

    /// Arguments passed to the program
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct SandboxArgs {
    /// Wall-clock limit for build + run, in milliseconds
    #[arg(long, env = "RUN_TIMEOUT_MS", default_value = "30000")]
    run_timeout_ms: u64,

    /// Wall-clock limit for the Lu translator, in milliseconds
    #[arg(long, env = "BUILD_TIMEOUT_MS", default_value = "10000")]
    build_timeout_ms: u64,

    /// How long a finished session waits for its websocket, in milliseconds
    #[arg(long, env = "WS_TIMEOUT_MS", default_value = "60000")]
    ws_timeout_ms: u64,

    /// Maximum bytes a client may send to the program
    #[arg(long, env = "ISTREAM_MAX", default_value = "1048576")]
    istream_max: usize,

    /// Maximum bytes the program may print
    #[arg(long, env = "OSTREAM_MAX", default_value = "1048576")]
    ostream_max: usize,

    /// Sandbox memory ceiling in MB
    #[arg(long, env = "SANDBOX_MEMORY_MB", default_value = "64")]
    memory_mb: u64,

    /// Open file descriptor ceiling for the sandboxed program
    #[arg(long, env = "SANDBOX_NOFILE", default_value = "256")]
    open_files: u64,

    /// Directory holding per-session workspaces
    #[arg(long, env = "SCRATCH_ROOT")]
    scratch_root: Option<PathBuf>,

    /// Checkout of the Lu translator
    #[arg(long, env = "LU_ROOT", default_value = "./lu-lang-py")]
    lu_root: PathBuf,

    #[arg(long, env = "ISOLATION", value_enum, default_value = "container")]
    isolation: IsolationArg,

    /// Container image providing the C toolchain
    #[arg(long, env = "SANDBOX_IMAGE", default_value = "gcc:latest")]
    image: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum IsolationArg {
    Container,
    Host,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LanguageArg {
    C,
    Lu,
}

impl From<LanguageArg> for Language {
    fn from(arg: LanguageArg) -> Self {
        match arg {
            LanguageArg::C => Language::C,
            LanguageArg::Lu => Language::Lu,
        }
    }
}

impl SandboxArgs {
    fn into_config(self) -> Config {
        let isolation = match self.isolation {
            IsolationArg::Container => Isolation::Container { image: self.image },
            IsolationArg::Host => Isolation::Host,
        };
        Config {
            scratch_root: self.scratch_root.unwrap_or_else(default_scratch_root),
            lu_root: self.lu_root,
            isolation,
            toolchain: Toolchain::default(),
            limits: Limits {
                run_timeout: Duration::from_millis(self.run_timeout_ms),
                build_timeout: Duration::from_millis(self.build_timeout_ms),
                memory_bytes: self.memory_mb * 1024 * 1024,
                open_files: self.open_files,
                input_cap: self.istream_max,
                output_cap: self.ostream_max,
                grace_window: Duration::from_millis(self.ws_timeout_ms),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args = Args::parse();
    match args.command {
        Commands::Serve(serve) => run_service(serve).await,
        Commands::Run(run) => {
            let code = run_oneshot(run).await?;
            std::process::exit(code);
        }
    }
}

async fn run_service(args: ServeArgs) -> Result<()> {
    let config = args.sandbox.into_config();
    info!(scratch_root = %config.scratch_root.display(), isolation = ?config.isolation, "Configuration loaded");
    if !config.lu_root.join("src").join("main.py").exists() {
        warn!(lu_root = %config.lu_root.display(), "Lu translator not found; Lu submissions will fail");
    }

    let mut state = AppState::new(config);
    if let Some(url) = args.frontend_url {
        state = state.with_frontend_url(url);
    }
    // Stale workspaces must be gone before the first allocation.
    state.pipeline.startup().await;

    http_server::run_server(&args.host, args.port, state)
        .await
        .context("HTTP server failed")
}

/// Mirrors the service pipeline against this terminal and returns the exit code.
async fn run_oneshot(args: RunArgs) -> Result<i32> {
    let input = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let pipeline = Pipeline::new(args.sandbox.into_config(), SessionRegistry::new());

    let key = pipeline
        .submit(Submission {
            input,
            args: args.args,
            language: args.language.into(),
        })
        .await?;
    let bridge = pipeline
        .registry()
        .lookup(&key)
        .context("session disappeared before attach")?;

    let (transport, mut frames) = Transport::channel();
    bridge.attach(transport);

    let stdin_bridge = bridge.clone();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 4096];
        while let Ok(n) = stdin.read(&mut buf).await {
            if n == 0 {
                break;
            }
            stdin_bridge.deliver_input(&buf[..n]);
        }
    });

    let mut stdout = tokio::io::stdout();
    while let Some(Frame::Data(bytes)) = frames.recv().await {
        stdout.write_all(&bytes).await?;
        stdout.flush().await?;
    }

    // The workspace is released right after the terminal notice goes out.
    let released = tokio::time::timeout(Duration::from_secs(10), async {
        while pipeline.workspaces().live_count() > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if released.is_err() {
        warn!(key = %key, "Workspace still present on exit");
    }

    Ok(match bridge.terminal() {
        Terminal::Exited(code) => code,
        Terminal::Aborted => 124,
        Terminal::Errored(_) | Terminal::Running => 1,
    })
}
