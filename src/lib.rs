pub mod backend;
pub mod conversation_screen;
pub mod conversation_store;
pub mod input_controller;
pub mod logging;
pub mod scroll_coordinator;
pub mod send_pipeline;
pub mod settings_store;
pub mod transcription_service;

use std::{collections::HashSet, io::Write, path::PathBuf, sync::Arc};

use backend::http::{HttpBackend, HttpBackendConfig};
use conversation_screen::{ConversationScreen, RenderItem, ScreenConfig, UiSignal};
use conversation_store::{ConversationRef, MessageId};
use settings_store::{ComposerSettings, ComposerSettingsUpdate, SettingsStore};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use transcription_service::UnsupportedRecognizer;

const DATA_DIR_ENV: &str = "CHAT_COMPOSER_HOME";
const CONVERSATION_ENV: &str = "CHAT_COMPOSER_CONVERSATION";
const DEFAULT_DATA_DIR_NAME: &str = ".chat-composer";
const DEFAULT_CONVERSATION: &str = "default";

const COMMAND_QUIT: &str = "/quit";
const COMMAND_RETRY: &str = "/retry";
const COMMAND_LOG: &str = "/log";
const COMMAND_SET: &str = "/set";

/// Runs the terminal client: every stdin line is sent as a message and the
/// reply is printed as it streams in.
pub async fn run() -> Result<(), String> {
    let data_dir = resolve_data_dir()?;
    let logging_state = logging::initialize(&data_dir)?;

    let settings_store = SettingsStore::new(&data_dir);
    let settings = settings_store.load()?;

    let backend = HttpBackend::new(HttpBackendConfig::from_env_with_base_url(
        settings.backend_url.clone(),
    ))?;
    let conversation = ConversationRef::new(
        read_non_empty_env(CONVERSATION_ENV).unwrap_or_else(|| DEFAULT_CONVERSATION.to_string()),
    );

    let (mut screen, mut signals) = ConversationScreen::new(
        conversation,
        Arc::new(backend),
        Arc::new(UnsupportedRecognizer),
        screen_config(&settings),
    );

    match screen.load_history().await {
        Ok(count) => info!(count, "conversation history loaded"),
        Err(error) => warn!(error = %error, "conversation history unavailable"),
    }

    let mut view = TerminalView::default();
    view.refresh(&screen);
    view.history_printed();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(&mut screen, &line, &logging_state, &settings_store) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        screen.close();
                        return Err(format!("Failed to read from stdin: {error}"));
                    }
                }
            }
            Some(event) = screen.next_event() => screen.handle_event(event),
        }

        while let Ok(signal) = signals.try_recv() {
            view.apply(signal, &screen);
        }
    }

    screen.close();
    Ok(())
}

fn screen_config(settings: &ComposerSettings) -> ScreenConfig {
    ScreenConfig {
        recording_mode: settings.recording_mode(),
        scroll: settings.scroll_config(),
        retry_policy: settings.retry_policy(),
    }
}

/// Returns `false` when the user asked to quit.
fn handle_line(
    screen: &mut ConversationScreen,
    line: &str,
    logging_state: &logging::LoggingState,
    settings_store: &SettingsStore,
) -> bool {
    let trimmed = line.trim();
    let (command, argument) = trimmed
        .split_once(' ')
        .map_or((trimmed, ""), |(command, argument)| (command, argument.trim()));

    match command {
        COMMAND_QUIT => false,
        COMMAND_LOG => {
            print_log_tail(logging_state, argument);
            true
        }
        COMMAND_SET => {
            apply_setting(screen, settings_store, argument);
            true
        }
        COMMAND_RETRY => {
            let draft = screen.input_state().draft().to_string();
            if !screen.send_tapped(&draft) {
                println!("(nothing to retry)");
            }
            true
        }
        _ => {
            if !screen.send_tapped(line) && screen.is_sending() {
                println!("(still waiting for the previous reply)");
            }
            true
        }
    }
}

fn print_log_tail(logging_state: &logging::LoggingState, argument: &str) {
    let count = argument.parse().unwrap_or(logging::DEFAULT_TAIL_LINES);
    println!(
        "log file: {} (filter `{}`)",
        logging_state.log_file_path().display(),
        logging_state.filter()
    );
    match logging_state.tail(count) {
        Ok(lines) => {
            for line in lines {
                println!("  {line}");
            }
        }
        Err(error) => println!("! {error}"),
    }
}

/// `/set <key> <value>` persists one setting and applies it to the open screen.
fn apply_setting(screen: &mut ConversationScreen, settings_store: &SettingsStore, argument: &str) {
    let (key, value) = argument.split_once(' ').unwrap_or((argument, ""));
    let updated = ComposerSettingsUpdate::from_assignment(key, value)
        .and_then(|update| settings_store.update(update));

    match updated {
        Ok(settings) => {
            screen.apply_config(screen_config(&settings));
            info!(setting = key, "setting updated");
            if key == "backend_url" {
                println!("(saved; the backend address is used from the next start)");
            } else {
                println!("(saved)");
            }
        }
        Err(error) => println!("! {error}"),
    }
}

#[derive(Debug, Default)]
struct TerminalView {
    printed: HashSet<MessageId>,
    streaming: Option<(MessageId, usize)>,
    thinking_shown: bool,
    hint_shown: bool,
    live: bool,
}

impl TerminalView {
    /// From here on the user's own lines are already on screen.
    fn history_printed(&mut self) {
        self.live = true;
    }

    fn apply(&mut self, signal: UiSignal, screen: &ConversationScreen) {
        match signal {
            UiSignal::ConversationChanged => self.refresh(screen),
            UiSignal::SendFailed { message } => {
                self.end_stream();
                println!("! {message}");
                println!("  (type {COMMAND_RETRY} to send it again)");
            }
            UiSignal::PermissionRequired => {
                println!("! microphone and speech access is required for dictation");
            }
            UiSignal::RecognitionUnavailable { message } => println!("! {message}"),
            UiSignal::ScrollToLatest { .. }
            | UiSignal::DismissKeyboard
            | UiSignal::InputStateChanged(_) => {}
        }
    }

    fn refresh(&mut self, screen: &ConversationScreen) {
        let mut stdout = std::io::stdout();

        for item in screen.render_items() {
            match item {
                RenderItem::Message {
                    id,
                    author_is_user,
                    content,
                } => {
                    if !self.printed.insert(id.clone()) {
                        continue;
                    }
                    self.reset_thinking();
                    if self.is_streaming(&id) {
                        let written = self.streaming.as_ref().map_or(0, |(_, len)| *len);
                        println!("{}", content.get(written..).unwrap_or_default());
                        self.streaming = None;
                    } else if !author_is_user {
                        println!("assistant> {content}");
                    } else if !self.live {
                        println!("you> {content}");
                    }
                }
                RenderItem::Streaming { id, text } => {
                    self.reset_thinking();
                    if !self.is_streaming(&id) {
                        print!("assistant> ");
                        self.streaming = Some((id.clone(), 0));
                    }
                    let written = self.streaming.as_ref().map_or(0, |(_, len)| *len);
                    match text.get(written..) {
                        Some(fresh) => print!("{fresh}"),
                        None => print!("\n(reconnecting)\nassistant> {text}"),
                    }
                    self.streaming = Some((id, text.len()));
                    let _ = stdout.flush();
                }
                RenderItem::Thinking { hint } => {
                    if self.streaming.take().is_some() {
                        println!("\n(reconnecting)");
                    }
                    if !self.thinking_shown {
                        println!("(thinking...)");
                        self.thinking_shown = true;
                    }
                    if let Some(hint) = hint.filter(|_| !self.hint_shown) {
                        println!("({hint})");
                        self.hint_shown = true;
                    }
                }
            }
        }
    }

    fn is_streaming(&self, id: &MessageId) -> bool {
        self.streaming
            .as_ref()
            .is_some_and(|(streaming_id, _)| streaming_id == id)
    }

    fn end_stream(&mut self) {
        if self.streaming.take().is_some() {
            println!();
        }
        self.reset_thinking();
    }

    fn reset_thinking(&mut self) {
        self.thinking_shown = false;
        self.hint_shown = false;
    }
}

fn resolve_data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = read_non_empty_env(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    read_non_empty_env("HOME")
        .map(|home| PathBuf::from(home).join(DEFAULT_DATA_DIR_NAME))
        .ok_or_else(|| format!("Set `{DATA_DIR_ENV}` or `HOME` to choose a data directory"))
}

fn read_non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
