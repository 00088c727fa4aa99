use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::seq::SliceRandom;
use rand::Rng;
use speedheart::{
    api::{InMemoryBackend, RemoteStateClient, SupabaseRestClient},
    config::{AppConfig, ConfigManager},
    logging,
    models::{
        ChatRow, Decision, EndingStatus, InteractionRequest, Message, ProfileRow, SessionId,
        SessionStatus, StatusChange, UserId,
    },
    session::{
        timer::TimerSnapshot, ChatSessionController, Notice, NoticeLevel, Route, SessionCommand,
        SessionExit, UiContext, SESSION_DURATION,
    },
    Choice,
};
use std::collections::HashSet;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "speedheart")]
#[command(about = "Speed-dating live chat session client", long_about = None)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a live speed-dating chat
    Chat {
        /// Chat session id
        chat_id: String,
        /// Local user id (defaults to backend.user_id from the config)
        #[arg(long)]
        user: Option<String>,
    },
    /// Run an offline session against a scripted partner
    Demo {
        /// Seconds already elapsed on the session clock
        #[arg(long, default_value_t = 150)]
        elapsed: u64,
    },
    /// Inspect or reset the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

/// Terminal front end
struct TerminalUi {
    me: Option<UserId>,
    printed: HashSet<String>,
    last_clock: Option<u64>,
}

impl TerminalUi {
    fn new(me: Option<UserId>) -> Self {
        Self {
            me,
            printed: HashSet::new(),
            last_clock: None,
        }
    }
}

impl UiContext for TerminalUi {
    fn notify(&mut self, notice: Notice) {
        let icon = match notice.level {
            NoticeLevel::Info => "ℹ️",
            NoticeLevel::Success => "🎉",
            NoticeLevel::Error => "⚠️",
        };
        println!("{} {}: {}", icon, notice.title, notice.description);
    }

    fn navigate(&mut self, route: Route) {
        println!("➡️  {}", route.path());
    }

    fn render_timer(&mut self, snapshot: &TimerSnapshot) {
        let due = snapshot.remaining_secs % 30 == 0
            || (snapshot.low_time && snapshot.remaining_secs % 5 == 0)
            || snapshot.remaining_secs <= 5;
        if due && self.last_clock != Some(snapshot.remaining_secs) {
            self.last_clock = Some(snapshot.remaining_secs);
            println!("⏱️  {} left", snapshot.clock);
        }
    }

    fn render_messages(&mut self, messages: &[Message]) {
        for message in messages {
            if !self.printed.insert(message.id.0.clone()) {
                continue;
            }
            let author = if Some(&message.sender_id) == self.me.as_ref() {
                "you".to_string()
            } else {
                message.sender_id.0.clone()
            };
            println!("[{}] {}: {}", message.sent_at.format("%H:%M:%S"), author, message.body);
        }
    }

    fn restore_input(&mut self, text: &str) {
        println!("↩️  Not sent, type it again: {}", text);
    }
}

fn parse_line(line: &str) -> Option<SessionCommand> {
    let trimmed = line.trim();
    match trimmed {
        "" => None,
        "/like" => Some(SessionCommand::Decide(Choice::Like)),
        "/pass" => Some(SessionCommand::Decide(Choice::Pass)),
        "/end" => {
            println!("End this chat? Type /yes or /no");
            Some(SessionCommand::RequestEndChat)
        }
        "/yes" => Some(SessionCommand::ConfirmEndChat),
        "/no" => Some(SessionCommand::CancelEndChat),
        "/leave" => Some(SessionCommand::Leave),
        other if other.starts_with('/') => {
            println!("Commands: /like /pass /end /yes /no /leave");
            None
        }
        _ => Some(SessionCommand::Send(line.to_string())),
    }
}

/// stdin・Ctrl+Cを操作チャンネルにつないでセッションを実行
async fn run_session(
    remote: Arc<dyn RemoteStateClient>,
    session_id: SessionId,
    me: Option<UserId>,
) -> Result<SessionExit> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let signal_tx = command_tx.clone();
    ctrlc::set_handler(move || {
        tracing::info!("🛑 終了シグナルを受信しました");
        let _ = signal_tx.send(SessionCommand::Leave);
    })
    .context("Failed to set signal handler")?;

    // 標準入力はブロッキングなので専用スレッドで読む（終了時に待たない）
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if let Some(command) = parse_line(&line) {
                if command_tx.send(command).is_err() {
                    break;
                }
            }
        }
    });

    let ui = TerminalUi::new(me.clone());
    let controller = ChatSessionController::new(session_id, me, remote, Box::new(ui));
    Ok(controller.run(command_rx).await)
}

async fn run_chat(config: &AppConfig, chat_id: String, user: Option<String>) -> Result<SessionExit> {
    let endpoint = config.backend.endpoint()?;
    let me = user.map(UserId).or_else(|| config.backend.user());
    if me.is_none() {
        tracing::warn!("⚠️ No user id configured, joining read-only");
    }

    let client = SupabaseRestClient::new(endpoint, config.realtime.clone());
    run_session(Arc::new(client), SessionId(chat_id), me).await
}

const DEMO_CHAT: &str = "demo-chat";
const DEMO_PARTNER: &str = "alex";
const DEMO_USER: &str = "you";

const DEMO_LINES: &[&str] = &[
    "Hi! How's your day going?",
    "What do you do for fun?",
    "I just got back from a hiking trip 🏔️",
    "Coffee or tea?",
    "Ha, that's a great answer",
    "Any good book recommendations?",
];

/// 相手役：ときどき発言し、時間切れ後にランダムで決定する
async fn scripted_partner(backend: Arc<InMemoryBackend>, expires_at: chrono::DateTime<Utc>) {
    let session_id = SessionId(DEMO_CHAT.to_string());
    let partner = UserId(DEMO_PARTNER.to_string());

    loop {
        let pause = rand::thread_rng().gen_range(4..9);
        tokio::time::sleep(Duration::from_secs(pause)).await;

        let active = backend
            .session(DEMO_CHAT)
            .map(|row| row.status == SessionStatus::Active.as_str())
            .unwrap_or(false);
        if !active {
            return;
        }

        if Utc::now() < expires_at {
            let line = DEMO_LINES
                .choose(&mut rand::thread_rng())
                .copied()
                .unwrap_or("Hi!");
            if let Some(message) = Message::compose(&partner, line, Utc::now()) {
                if let Err(e) = backend.append_message(&session_id, &message.to_wire()).await {
                    tracing::warn!("⚠️ [DEMO] Partner message failed: {}", e);
                }
            }
            continue;
        }

        let choice = if rand::thread_rng().gen_bool(0.6) {
            Choice::Like
        } else {
            Choice::Pass
        };
        tracing::debug!("🎲 [DEMO] Partner chose {}", choice);
        let decision = Decision {
            participant_id: partner.clone(),
            session_id: session_id.clone(),
            choice,
            submitted_at: Utc::now(),
        };
        let request = InteractionRequest::from_decision(&decision, &UserId(DEMO_USER.to_string()));
        backend.record_interaction(&request);

        if choice == Choice::Pass {
            let change = StatusChange {
                status: EndingStatus::EndedManually,
                ended_by: partner.clone(),
                ended_at: Utc::now(),
            };
            if let Err(e) = backend.update_status(&session_id, &change).await {
                tracing::warn!("⚠️ [DEMO] Partner pass failed: {}", e);
            }
        }
        return;
    }
}

async fn run_demo(elapsed: u64) -> Result<SessionExit> {
    let elapsed = Duration::from_secs(elapsed.min(SESSION_DURATION.as_secs()));
    let started_at = Utc::now() - chrono::Duration::from_std(elapsed)?;
    let expires_at = started_at + chrono::Duration::from_std(SESSION_DURATION)?;

    let backend = Arc::new(InMemoryBackend::new());
    backend.insert_session(ChatRow::new_active(
        DEMO_CHAT,
        DEMO_USER,
        DEMO_PARTNER,
        Some(started_at),
    ));
    backend.insert_profile(ProfileRow {
        id: DEMO_PARTNER.to_string(),
        name: Some("Alex".to_string()),
        age: Some(28),
        bio: Some("Weekend hiker, weekday coder.".to_string()),
        photo_url: None,
        preferences: Some(serde_json::json!({"interests": ["hiking", "books", "coffee"]})),
    });

    println!(
        "💘 Demo speed date with Alex. Type messages, /like or /pass when time is up, /end, /leave."
    );
    tokio::spawn(scripted_partner(backend.clone(), expires_at));

    run_session(
        backend,
        SessionId(DEMO_CHAT.to_string()),
        Some(UserId(DEMO_USER.to_string())),
    )
    .await
}

fn run_config(manager: &ConfigManager, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = manager.load_config()?;
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            println!("{}", rendered);
        }
        ConfigAction::Path => println!("{}", manager.get_config_file_path().display()),
        ConfigAction::Reset => {
            if manager.config_exists() {
                let backup = manager.backup_config()?;
                println!("Previous config saved to {}", backup.display());
            }
            manager.reset_config()?;
            println!("Config reset to defaults");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let config = manager.load_config().unwrap_or_else(|e| {
        eprintln!("設定読み込みエラー、デフォルト設定を使用: {:#}", e);
        AppConfig::default()
    });

    // tokio-consoleの初期化（プロファイリング用）
    #[cfg(feature = "debug-tokio")]
    console_subscriber::init();

    #[cfg(not(feature = "debug-tokio"))]
    let _log_guard = logging::init_logging(&config.log)?;

    tracing::info!("💘 Starting speedheart");

    let exit = match cli.command {
        Commands::Chat { chat_id, user } => run_chat(&config, chat_id, user).await?,
        Commands::Demo { elapsed } => run_demo(elapsed).await?,
        Commands::Config { action } => {
            run_config(&manager, action)?;
            return Ok(());
        }
    };

    match exit {
        SessionExit::Navigated(route) => println!("👋 Session finished ({})", route.path()),
        SessionExit::Left => println!("👋 You left the chat"),
        SessionExit::LoadFailed => println!("❌ Could not open the chat"),
        SessionExit::Closed => println!("👋 Input closed"),
    }
    tracing::info!("👋 speedheart shutting down");
    Ok(())
}
