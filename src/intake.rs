// Request intake: turns incoming chat messages into jobs, toggles and help

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::captions::{self, escape_text};
use crate::messaging::{ChatTarget, MessagingService};
use crate::prefs::{PreferenceStore, WelcomeScope};
use crate::scheduler::{new_output_prefix, Job, JobSink};
use crate::source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    /// Group or supergroup
    Group,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl Sender {
    /// Full name, else `@username`, else the numeric id
    pub fn label(&self) -> String {
        let full = format!(
            "{} {}",
            self.first_name.trim(),
            self.last_name.as_deref().unwrap_or("").trim()
        );
        let full = full.trim();
        if !full.is_empty() {
            return full.to_string();
        }
        match self.username.as_deref().filter(|u| !u.is_empty()) {
            Some(username) => format!("@{}", username),
            None => self.id.to_string(),
        }
    }

    /// `@username` when there is one, otherwise the label
    fn handle(&self) -> String {
        match self.username.as_deref().filter(|u| !u.is_empty()) {
            Some(username) => format!("@{}", username),
            None => self.label(),
        }
    }
}

/// Platform-neutral view of an incoming message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub chat_kind: ChatKind,
    pub chat_title: Option<String>,
    pub thread_id: Option<i64>,
    pub message_id: i64,
    pub sender: Option<Sender>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub new_members: Vec<Sender>,
}

impl IncomingMessage {
    fn body(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    fn target(&self) -> ChatTarget {
        ChatTarget::new(self.chat_id, self.thread_id)
    }
}

/// What intake did with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Ignored,
    HelpSent,
    /// Sender's new opt-out state
    Toggled(bool),
    /// Opted-out sender posted a link without mentioning the bot
    SkippedOptedOut,
    Submitted { accepted: bool },
}

#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub bot_id: i64,
    /// Without the leading `@`
    pub bot_username: String,
    pub logs_chat_id: Option<i64>,
    pub max_bytes: Option<u64>,
    pub concurrency_hint: u32,
}

pub struct Intake {
    settings: IntakeSettings,
    bot_username_lower: String,
    prefs: Arc<PreferenceStore>,
    messenger: Arc<dyn MessagingService>,
    sink: Arc<dyn JobSink>,
}

fn is_command(body: &str, names: &[&str]) -> bool {
    let first = body.split_whitespace().next().unwrap_or("");
    let Some(command) = first.strip_prefix('/') else {
        return false;
    };
    let name = command.split('@').next().unwrap_or("");
    names.iter().any(|n| n.eq_ignore_ascii_case(name))
}

/// "me", "я" as separate words, or the sender's own @username
fn mentions_self(text: &str, sender_username: Option<&str>) -> bool {
    lazy_static::lazy_static! {
        static ref ME_RE: Regex = Regex::new(r"(^|\s)(me|я)(\s|$)").unwrap();
    }

    let lower = text.to_lowercase();
    if ME_RE.is_match(&lower) {
        return true;
    }

    match sender_username.filter(|u| !u.is_empty()) {
        Some(username) => {
            let pattern = format!(r"@{}\b", regex::escape(&username.to_lowercase()));
            Regex::new(&pattern)
                .map(|re| re.is_match(&lower))
                .unwrap_or(false)
        }
        None => false,
    }
}

impl Intake {
    pub fn new(
        settings: IntakeSettings,
        prefs: Arc<PreferenceStore>,
        messenger: Arc<dyn MessagingService>,
        sink: Arc<dyn JobSink>,
    ) -> Self {
        let bot_username_lower = settings.bot_username.trim_start_matches('@').to_lowercase();
        Self {
            settings,
            bot_username_lower,
            prefs,
            messenger,
            sink,
        }
    }

    fn bot_mention(&self) -> String {
        if self.bot_username_lower.is_empty() {
            "@<bot>".to_string()
        } else {
            format!("@{}", self.bot_username_lower)
        }
    }

    fn mentions_bot(&self, text: &str) -> bool {
        !self.bot_username_lower.is_empty()
            && text
                .to_lowercase()
                .contains(&format!("@{}", self.bot_username_lower))
    }

    fn is_this_bot(&self, member: &Sender) -> bool {
        (self.settings.bot_id != 0 && member.id == self.settings.bot_id)
            || (!self.bot_username_lower.is_empty()
                && member
                    .username
                    .as_deref()
                    .is_some_and(|u| u.eq_ignore_ascii_case(&self.bot_username_lower)))
    }

    pub fn help_text(&self, group: bool) -> String {
        let mention = escape_text(&self.bot_mention());
        if group {
            format!(
                "<b>How to use</b>\n\
                 • Post a video link in the group: the bot downloads the video, posts it and deletes the original message.\n\
                 • The caption links back to the source and names the sender.\n\n\
                 <b>Turning automatic downloads off for yourself</b>\n\
                 • Write in the group: {m} @YourUsername (or \"me\")\n\
                 • Repeat to turn them back on.\n\n\
                 <b>When automatic downloads are off</b>\n\
                 • Download on request: {m} &lt;link&gt;",
                m = mention
            )
        } else {
            format!(
                "<b>I am a group bot</b>\n\
                 I download videos from links (YouTube, Instagram, TikTok, VK, X, Facebook, Telegram and more) and post them in the group.\n\n\
                 <b>Setup</b>\n\
                 1) Add me to a group.\n\
                 2) Make me an admin allowed to delete messages.\n\n\
                 <b>Default behaviour</b>\n\
                 • Any video link in the group is downloaded, posted, and the original message is deleted.\n\n\
                 <b>Turning automatic downloads off for yourself</b>\n\
                 • Write in the group: {m} @YourUsername (or \"me\")\n\
                 • Repeat to turn them back on.\n\n\
                 <b>When automatic downloads are off</b>\n\
                 • Download on request: {m} &lt;link&gt;",
                m = mention
            )
        }
    }

    async fn send_html(&self, target: ChatTarget, text: &str) -> bool {
        match self.messenger.send_text(target, text, true).await {
            Ok(()) => true,
            Err(e) => {
                warn!(chat_id = target.chat_id, error = %e, "failed to send message");
                false
            }
        }
    }

    async fn send_plain(&self, target: ChatTarget, text: &str) {
        if let Err(e) = self.messenger.send_text(target, text, false).await {
            warn!(chat_id = target.chat_id, error = %e, "failed to send message");
        }
    }

    /// Send help once per scope id
    async fn welcome_once(&self, scope: WelcomeScope, id: i64, target: ChatTarget, group: bool) -> Handled {
        if self.prefs.was_welcomed(scope, id).await {
            return Handled::Ignored;
        }
        if !self.send_html(target, &self.help_text(group)).await {
            return Handled::Ignored;
        }
        if let Err(e) = self.prefs.mark_welcomed(scope, id).await {
            warn!(id, error = %e, "failed to record welcome");
        }
        Handled::HelpSent
    }

    pub async fn handle(&self, msg: IncomingMessage) -> Handled {
        match msg.chat_kind {
            ChatKind::Private => self.handle_private(&msg).await,
            ChatKind::Group => self.handle_group(&msg).await,
            ChatKind::Other => Handled::Ignored,
        }
    }

    async fn handle_private(&self, msg: &IncomingMessage) -> Handled {
        let Some(body) = msg.body() else {
            return Handled::Ignored;
        };

        if is_command(body, &["start", "help"]) {
            self.send_html(msg.target(), &self.help_text(false)).await;
            return Handled::HelpSent;
        }

        match &msg.sender {
            Some(sender) => {
                self.welcome_once(WelcomeScope::User, sender.id, msg.target(), false)
                    .await
            }
            None => Handled::Ignored,
        }
    }

    async fn handle_group(&self, msg: &IncomingMessage) -> Handled {
        if msg.new_members.iter().any(|m| self.is_this_bot(m)) {
            return self
                .welcome_once(WelcomeScope::Group, msg.chat_id, msg.target(), true)
                .await;
        }

        let Some(sender) = msg.sender.as_ref().filter(|s| !s.is_bot) else {
            return Handled::Ignored;
        };
        let Some(body) = msg.body() else {
            return Handled::Ignored;
        };

        if body.starts_with('/') {
            if is_command(body, &["start", "help"]) {
                self.send_html(msg.target(), &self.help_text(true)).await;
                return Handled::HelpSent;
            }
            return Handled::Ignored;
        }

        let mentioned = self.mentions_bot(body);

        if mentioned && mentions_self(body, sender.username.as_deref()) {
            return self.toggle(msg, sender).await;
        }

        let Some(url) = source::extract_first_url(body) else {
            return Handled::Ignored;
        };

        self.log_request(msg, sender, &url).await;

        let opted_out = self.prefs.is_opted_out(msg.chat_id, sender.id).await;
        if opted_out && !mentioned {
            debug!(chat_id = msg.chat_id, user_id = sender.id, "sender opted out, link ignored");
            return Handled::SkippedOptedOut;
        }

        let notify_on_failure = opted_out && mentioned;
        let job = Job {
            id: Uuid::new_v4(),
            category: source::classify(&url),
            source_name: source::display_name(&url),
            url,
            output_prefix: new_output_prefix(),
            max_bytes: self.settings.max_bytes,
            concurrency_hint: self.settings.concurrency_hint,
            notify_on_failure,
            delete_original_on_success: true,
            target: msg.target(),
            original_message_id: msg.message_id,
            sender_label: sender.label(),
        };
        let job_id = job.id;

        let accepted = self.sink.submit(job);
        if accepted {
            info!(%job_id, chat_id = msg.chat_id, "job queued");
        } else if notify_on_failure {
            self.send_plain(msg.target(), captions::FAILURE_TEXT).await;
        }

        Handled::Submitted { accepted }
    }

    async fn toggle(&self, msg: &IncomingMessage, sender: &Sender) -> Handled {
        let opted_out = match self.prefs.toggle_opt_out(msg.chat_id, sender.id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(chat_id = msg.chat_id, user_id = sender.id, error = %e, "failed to toggle opt-out");
                return Handled::Ignored;
            }
        };

        let who = sender.handle();
        let reply = if opted_out {
            format!(
                "{}, automatic downloads are now off for you.\n\
                 To download a video, mention the bot with the link: {} <link>",
                who,
                self.bot_mention()
            )
        } else {
            format!(
                "{}, automatic downloads are back on for you.\n\
                 Just post links.",
                who
            )
        };
        self.send_plain(msg.target(), &reply).await;

        Handled::Toggled(opted_out)
    }

    async fn log_request(&self, msg: &IncomingMessage, sender: &Sender, url: &str) {
        let Some(logs_chat) = self.settings.logs_chat_id else {
            return;
        };

        let username = match sender.username.as_deref().filter(|u| !u.is_empty()) {
            Some(u) => format!("@{}", u),
            None => "(no username)".to_string(),
        };
        let text = format!(
            "Download request from {} ({})\nChat: {} ({})\nURL: {}",
            username,
            sender.id,
            msg.chat_title.as_deref().unwrap_or("Group"),
            msg.chat_id,
            url
        );
        self.send_plain(ChatTarget::chat(logs_chat), &text).await;
    }
}
