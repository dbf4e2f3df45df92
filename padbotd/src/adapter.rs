use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use padbot_common::transport::{ChatEvent, OutboundMessage};
use padbot_common::{AccessLevel, InputSequence, User};

use crate::controller::ControllerManager;
use crate::executor::InputExecutor;
use crate::macros::{self, ExpansionError};
use crate::parser::{self, ParseError, ParserContext, Vocabulary};
use crate::pump::OutboundSender;
use crate::SharedState;

/// Translates chat transport events into the input pipeline
///
/// Every inbound message walks the same path: user bookkeeping, command
/// dispatch, meme lookup, then macro expansion and parsing. A valid parse
/// hands the sequence to the executor with the user's team as its default
/// port.
pub struct EventAdapter {
    pub(crate) state: SharedState,
    pub(crate) manager: Arc<ControllerManager>,
    pub(crate) executor: Arc<InputExecutor>,
    pub(crate) vocabulary: Arc<Vocabulary>,
    pub(crate) outbound: OutboundSender,
    pub(crate) save_tx: mpsc::Sender<()>,
    pub(crate) bot_name: String,
    pub(crate) channel: String,
}

impl EventAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedState,
        manager: Arc<ControllerManager>,
        executor: Arc<InputExecutor>,
        vocabulary: Arc<Vocabulary>,
        outbound: OutboundSender,
        save_tx: mpsc::Sender<()>,
        bot_name: String,
        channel: String,
    ) -> Self {
        Self {
            state,
            manager,
            executor,
            vocabulary,
            outbound,
            save_tx,
            bot_name,
            channel,
        }
    }

    pub(crate) fn say(&self, text: String) {
        self.outbound.send(OutboundMessage {
            channel: self.channel.clone(),
            text,
        });
    }

    /// Coalesced lazy-persistence signal
    pub(crate) fn mark_dirty(&self) {
        let _ = self.save_tx.try_send(());
    }

    pub async fn handle_event(&self, event: ChatEvent) {
        match event {
            ChatEvent::Connected | ChatEvent::Reconnected => {
                let (message, sigil) = {
                    let state = self.state.read().await;
                    (
                        state.settings.connect_message.clone(),
                        state.settings.command_sigil.clone(),
                    )
                };
                self.say(message.replace("{0}", &self.bot_name).replace("{1}", &sigil));
            }
            ChatEvent::Disconnected => {
                warn!("Chat transport disconnected");
            }
            ChatEvent::JoinedChannel { channel } => {
                info!("Joined channel {}", channel);
            }
            ChatEvent::MessageReceived { user, text } => {
                self.handle_message(&user, &text).await;
            }
            ChatEvent::WhisperReceived { user, .. } => {
                debug!("Ignoring whisper from {}", user);
            }
            ChatEvent::HostReceived { host } => {
                info!("Hosted by {}", host);
            }
            ChatEvent::Subscription { user } => {
                self.say(format!("Welcome aboard, {}!", user));
            }
            ChatEvent::Resubscription { user, months } => {
                self.say(format!("{} has been here for {} months!", user, months));
            }
        }
    }

    pub async fn handle_message(&self, name: &str, text: &str) {
        let name = name.to_lowercase();
        let text = text.trim();
        if name.is_empty() || text.is_empty() {
            return;
        }

        let sigil = {
            let mut state = self.state.write().await;
            let user = state
                .users
                .entry(name.clone())
                .or_insert_with(|| User::new(&name));
            if !user.opted_out {
                user.messages += 1;
            }
            state.settings.command_sigil.clone()
        };
        self.mark_dirty();

        if let Some(rest) = text.strip_prefix(&sigil) {
            self.handle_command(&name, rest.trim()).await;
            return;
        }

        // A meme reply never stops the text from also being an input try
        {
            let state = self.state.read().await;
            if let Some(reply) = state.memes.get(&text.to_lowercase()) {
                self.say(reply.clone());
            }
        }

        let parsed = {
            let state = self.state.read().await;
            let expanded = match macros::expand(&state.macros, text) {
                Ok(expanded) => expanded,
                // An unknown macro is just chat mentioning a hashtag
                Err(ExpansionError::UnknownMacro(_)) => return,
                Err(e) => {
                    self.say(format!("{}, {}", name, e));
                    return;
                }
            };

            let ctx = ParserContext {
                vocabulary: self.vocabulary.as_ref(),
                blacklist: &state.settings.blacklist,
                user_level: state
                    .users
                    .get(&name)
                    .map(|u| u.level)
                    .unwrap_or_default(),
                port_count: self.manager.count(),
                default_duration: state.settings.default_duration,
                default_unit: state.settings.default_duration_unit,
                frame_ms: state.settings.frame_ms,
                max_input_duration_ms: state.settings.max_input_duration_ms,
                max_simultaneous_ms: state.settings.max_simultaneous_duration_ms,
            };
            parser::parse(&expanded, &ctx)
        };

        match parsed {
            Ok(sequence) => self.dispatch_input(&name, sequence).await,
            // Ordinary chat, silently ignored
            Err(ParseError::NotAnInput) => {}
            Err(e) => self.say(format!("{}, {}", name, e)),
        }
    }

    /// A validated input: count it, verify the route, dispatch, and only
    /// then apply the auto-whitelist rule
    async fn dispatch_input(&self, name: &str, sequence: InputSequence) {
        let team = {
            let mut state = self.state.write().await;
            let Some(user) = state.users.get_mut(name) else {
                return;
            };
            user.valid_inputs += 1;
            user.team
        };
        self.mark_dirty();

        if team >= self.manager.count() {
            self.say(format!(
                "{}, your team's joystick {} is not connected",
                name,
                team + 1
            ));
            return;
        }
        if self.manager.is_degraded(team).await {
            self.say(format!(
                "{}, joystick {} is not responding right now",
                name,
                team + 1
            ));
            return;
        }

        if let Err(e) = self.executor.enqueue(name, sequence, team).await {
            self.say(format!("{}, {}", name, e));
            return;
        }
        debug!("Queued {}'s sequence on joystick {}", name, team + 1);

        // Promotion only follows a sequence that actually went out
        let announce = {
            let mut state = self.state.write().await;
            let enabled = state.settings.auto_whitelist_enabled;
            let threshold = state.settings.auto_whitelist_input_count;
            let template = state.settings.auto_whitelist_msg.clone();

            let Some(user) = state.users.get_mut(name) else {
                return;
            };
            if enabled
                && user.level < AccessLevel::Whitelisted
                && !user.auto_whitelisted
                && user.valid_inputs >= threshold
            {
                user.level = AccessLevel::Whitelisted;
                user.auto_whitelisted = true;
                info!("Auto-whitelisted {} after {} inputs", name, user.valid_inputs);
                Some(template.replace("{0}", name))
            } else {
                None
            }
        };
        if let Some(message) = announce {
            self.mark_dirty();
            self.say(message);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::{MockPad, PadEvent, BTN_SOUTH};
    use crate::config::{BotData, Settings};
    use crate::executor::ExecSettings;
    use crate::pump::OutboundQueue;
    use crate::BotState;
    use tokio::sync::RwLock;
    use tokio::time::{sleep, Duration};

    pub(crate) struct Harness {
        pub adapter: EventAdapter,
        pub state: SharedState,
        pub outbound: OutboundQueue,
        pub probes: Vec<MockPad>,
        pub save_rx: mpsc::Receiver<()>,
    }

    pub(crate) async fn harness(mut settings: Settings) -> Harness {
        settings.joystick_count = 2;
        let probes: Vec<MockPad> = (0..2).map(|_| MockPad::new()).collect();
        let factory_probes = probes.clone();
        let manager = Arc::new(
            ControllerManager::init(2, move |index| Box::new(factory_probes[index].clone())).await,
        );
        let outbound = OutboundQueue::new(32);
        let vocabulary = Arc::new(Vocabulary::standard());
        let executor = InputExecutor::start(
            Arc::clone(&manager),
            Arc::clone(&vocabulary),
            ExecSettings {
                frame_ms: settings.frame_ms,
                queue_depth: settings.input_queue_depth,
                hold_grace_ms: 40,
                channel: "#stream".into(),
            },
            outbound.sender(),
        );
        let (save_tx, save_rx) = mpsc::channel(8);
        let state: SharedState = Arc::new(RwLock::new(BotState::from_parts(
            settings,
            BotData::default(),
        )));
        let adapter = EventAdapter::new(
            Arc::clone(&state),
            manager,
            executor,
            vocabulary,
            outbound.sender(),
            save_tx,
            "padbot".into(),
            "#stream".into(),
        );
        Harness {
            adapter,
            state,
            outbound,
            probes,
            save_rx,
        }
    }

    fn pop_text(outbound: &OutboundQueue) -> Option<String> {
        outbound.pop().map(|m| m.text)
    }

    #[tokio::test]
    async fn test_first_message_creates_user() {
        let mut h = harness(Settings::default()).await;
        h.adapter.handle_message("NewViewer", "hello there").await;

        let state = h.state.read().await;
        let user = state.users.get("newviewer").unwrap();
        assert_eq!(user.messages, 1);
        assert_eq!(user.valid_inputs, 0);
        assert!(h.save_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_opted_out_user_is_not_counted() {
        let h = harness(Settings::default()).await;
        {
            let mut state = h.state.write().await;
            let mut user = User::new("ghost");
            user.opted_out = true;
            state.users.insert("ghost".into(), user);
        }
        h.adapter.handle_message("ghost", "just lurking").await;

        let state = h.state.read().await;
        assert_eq!(state.users.get("ghost").unwrap().messages, 0);
    }

    #[tokio::test]
    async fn test_meme_reply() {
        let h = harness(Settings::default()).await;
        {
            let mut state = h.state.write().await;
            state.memes.insert("gg".into(), "gg wp everyone".into());
        }
        h.adapter.handle_message("viewer", "GG").await;
        assert_eq!(pop_text(&h.outbound).unwrap(), "gg wp everyone");
    }

    #[tokio::test]
    async fn test_valid_input_reaches_device() {
        let h = harness(Settings::default()).await;
        h.adapter.handle_message("viewer", "a50ms").await;
        sleep(Duration::from_millis(150)).await;

        assert!(h.probes[0].events().contains(&PadEvent::Press(BTN_SOUTH)));
        let state = h.state.read().await;
        assert_eq!(state.users.get("viewer").unwrap().valid_inputs, 1);
    }

    #[tokio::test]
    async fn test_team_routes_to_second_pad() {
        let h = harness(Settings::default()).await;
        {
            let mut state = h.state.write().await;
            let mut user = User::new("teamtwo");
            user.team = 1;
            state.users.insert("teamtwo".into(), user);
        }
        h.adapter.handle_message("teamtwo", "a50ms").await;
        sleep(Duration::from_millis(150)).await;

        assert!(h.probes[0].events().is_empty());
        assert!(h.probes[1].events().contains(&PadEvent::Press(BTN_SOUTH)));
    }

    #[tokio::test]
    async fn test_invalid_port_gets_explained() {
        let h = harness(Settings::default()).await;
        h.adapter.handle_message("viewer", "a&3").await;

        let text = pop_text(&h.outbound).unwrap();
        assert!(text.contains("invalid joystick number 3"), "{}", text);
        // No device action
        sleep(Duration::from_millis(50)).await;
        assert!(h.probes[0].events().is_empty());
    }

    #[tokio::test]
    async fn test_blacklisted_input_gets_explained() {
        let h = harness(Settings::default()).await;
        // Default blacklist requires Moderator for start
        h.adapter.handle_message("viewer", "start").await;

        let text = pop_text(&h.outbound).unwrap();
        assert!(text.contains("requires moderator access"), "{}", text);
        sleep(Duration::from_millis(50)).await;
        assert!(h.probes[0].events().is_empty());
    }

    #[tokio::test]
    async fn test_normal_chat_is_silent() {
        let h = harness(Settings::default()).await;
        h.adapter.handle_message("viewer", "what a play!").await;
        h.adapter.handle_message("viewer", "#nosuchmacro").await;
        assert!(h.outbound.is_empty());
    }

    #[tokio::test]
    async fn test_macro_expansion_feeds_parser() {
        let h = harness(Settings::default()).await;
        {
            let mut state = h.state.write().await;
            state.macros.insert("#combo", "a50ms b50ms").unwrap();
        }
        h.adapter.handle_message("viewer", "#combo").await;
        sleep(Duration::from_millis(250)).await;

        let presses: Vec<u16> = h.probes[0]
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PadEvent::Press(code) => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(presses.len(), 2);
    }

    #[tokio::test]
    async fn test_auto_whitelist_fires_exactly_once_at_threshold() {
        let mut settings = Settings::default();
        settings.auto_whitelist_input_count = 2;
        let h = harness(settings).await;

        h.adapter.handle_message("viewer", "a50ms").await;
        {
            let state = h.state.read().await;
            assert_eq!(state.users.get("viewer").unwrap().level, AccessLevel::User);
        }

        h.adapter.handle_message("viewer", "b50ms").await;
        {
            let state = h.state.read().await;
            let user = state.users.get("viewer").unwrap();
            assert_eq!(user.level, AccessLevel::Whitelisted);
            assert!(user.auto_whitelisted);
        }

        // Drain the announcement, then confirm a third input stays quiet
        let mut announcements = 0;
        while let Some(text) = pop_text(&h.outbound) {
            if text.contains("whitelisted") {
                announcements += 1;
            }
        }
        assert_eq!(announcements, 1);

        h.adapter.handle_message("viewer", "x50ms").await;
        while let Some(text) = pop_text(&h.outbound) {
            assert!(!text.contains("whitelisted"), "{}", text);
        }
    }

    #[tokio::test]
    async fn test_auto_whitelist_requires_successful_dispatch() {
        let mut settings = Settings::default();
        settings.auto_whitelist_input_count = 1;
        let h = harness(settings).await;
        {
            let mut state = h.state.write().await;
            let mut user = User::new("farport");
            // A team beyond the two connected pads
            user.team = 7;
            state.users.insert("farport".into(), user);
        }

        h.adapter.handle_message("farport", "a50ms").await;

        {
            let state = h.state.read().await;
            let user = state.users.get("farport").unwrap();
            // The valid input still counts, but no promotion without dispatch
            assert_eq!(user.valid_inputs, 1);
            assert_eq!(user.level, AccessLevel::User);
            assert!(!user.auto_whitelisted);
        }
        let text = pop_text(&h.outbound).unwrap();
        assert!(text.contains("not connected"), "{}", text);
        while let Some(text) = pop_text(&h.outbound) {
            assert!(!text.contains("whitelisted"), "{}", text);
        }
    }

    #[tokio::test]
    async fn test_connect_event_announces() {
        let h = harness(Settings::default()).await;
        h.adapter.handle_event(ChatEvent::Connected).await;

        let text = pop_text(&h.outbound).unwrap();
        assert!(text.contains("padbot"), "{}", text);
        assert!(text.contains("!help"), "{}", text);
    }
}
