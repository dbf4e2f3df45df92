//! Sigil-prefixed chat commands
//!
//! Only the commands the input pipeline needs live here; anything else a
//! deployment wants (help text, credits queries) hangs off the same
//! dispatcher.

use tracing::info;

use padbot_common::{AccessLevel, User};

use crate::adapter::EventAdapter;
use crate::macros::MacroStore;
use crate::parser::{self, ParserContext};

impl EventAdapter {
    /// Dispatch one sigil-stripped command line
    pub(crate) async fn handle_command(&self, name: &str, rest: &str) {
        let mut parts = rest.split_whitespace();
        let Some(command) = parts.next() else { return };
        let args: Vec<&str> = parts.collect();

        match command.to_lowercase().as_str() {
            "addmacro" => self.cmd_add_macro(name, &args).await,
            "removemacro" => self.cmd_remove_macro(name, &args).await,
            "stopall" => self.cmd_stop_all(name).await,
            "optout" => self.cmd_set_opt_out(name, true).await,
            "optin" => self.cmd_set_opt_out(name, false).await,
            "whitelist" => self.cmd_whitelist(name, &args).await,
            // Not a command of ours; stay quiet like any other chat line
            _ => {}
        }
    }

    async fn require_level(&self, name: &str, required: AccessLevel) -> bool {
        let state = self.state.read().await;
        let level = state
            .users
            .get(name)
            .map(|u| u.level)
            .unwrap_or_default();
        if level >= required {
            true
        } else {
            self.say(format!("{}, that command needs {} access", name, required));
            false
        }
    }

    async fn cmd_add_macro(&self, name: &str, args: &[&str]) {
        if !self.require_level(name, AccessLevel::Moderator).await {
            return;
        }
        let [key, body @ ..] = args else {
            self.say(format!("{}, usage: addmacro #name expansion", name));
            return;
        };
        if body.is_empty() {
            self.say(format!("{}, usage: addmacro #name expansion", name));
            return;
        }
        let key = key.to_lowercase();
        let body = body.join(" ");

        if let Err(e) = MacroStore::validate_key(&key) {
            self.say(format!("{}, {}", name, e));
            return;
        }
        if let Err(e) = self.test_parse_macro(&key, &body).await {
            self.say(format!("{}, that macro doesn't play: {}", name, e));
            return;
        }

        let result = {
            let mut state = self.state.write().await;
            state.macros.insert(&key, &body)
        };
        match result {
            Ok(()) => self.say(format!("Macro {} saved", key)),
            Err(e) => self.say(format!("{}, {}", name, e)),
        }
    }

    /// A stored macro must play for everyone, so its body (with any
    /// placeholders filled by a valid input) has to parse under the current
    /// vocabulary
    async fn test_parse_macro(&self, key: &str, body: &str) -> Result<(), String> {
        let state = self.state.read().await;

        let arity = padbot_common::macro_key_arity(key);
        let sample = self
            .vocabulary
            .sample_input()
            .ok_or_else(|| "empty input vocabulary".to_string())?;
        let mut substituted = body.to_string();
        for i in 0..arity {
            substituted = substituted.replace(&format!("<{}>", i), sample);
        }

        let expanded =
            crate::macros::expand(&state.macros, &substituted).map_err(|e| e.to_string())?;
        let ctx = ParserContext {
            vocabulary: self.vocabulary.as_ref(),
            blacklist: &state.settings.blacklist,
            user_level: AccessLevel::Superadmin,
            port_count: self.manager.count(),
            default_duration: state.settings.default_duration,
            default_unit: state.settings.default_duration_unit,
            frame_ms: state.settings.frame_ms,
            max_input_duration_ms: state.settings.max_input_duration_ms,
            max_simultaneous_ms: state.settings.max_simultaneous_duration_ms,
        };
        parser::parse(&expanded, &ctx).map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn cmd_remove_macro(&self, name: &str, args: &[&str]) {
        if !self.require_level(name, AccessLevel::Moderator).await {
            return;
        }
        let [key] = args else {
            self.say(format!("{}, usage: removemacro #name", name));
            return;
        };

        let removed = {
            let mut state = self.state.write().await;
            state.macros.remove_by_name(key)
        };
        if removed {
            self.say(format!("Macro {} removed", key.to_lowercase()));
        } else {
            self.say(format!("{}, no macro named {}", name, key));
        }
    }

    async fn cmd_stop_all(&self, name: &str) {
        if !self.require_level(name, AccessLevel::Moderator).await {
            return;
        }
        self.executor.cancel_all().await;
        info!("{} stopped all sequences", name);
        self.say("All input sequences stopped".to_string());
    }

    async fn cmd_set_opt_out(&self, name: &str, opted_out: bool) {
        {
            let mut state = self.state.write().await;
            let user = state
                .users
                .entry(name.to_string())
                .or_insert_with(|| User::new(name));
            user.opted_out = opted_out;
        }
        self.mark_dirty();
        if opted_out {
            self.say(format!("{}, your activity is no longer tracked", name));
        } else {
            self.say(format!("{}, welcome back on the scoreboard", name));
        }
    }

    async fn cmd_whitelist(&self, name: &str, args: &[&str]) {
        if !self.require_level(name, AccessLevel::Moderator).await {
            return;
        }
        let [target] = args else {
            self.say(format!("{}, usage: whitelist <user>", name));
            return;
        };
        let target = target.to_lowercase();

        {
            let mut state = self.state.write().await;
            let user = state
                .users
                .entry(target.clone())
                .or_insert_with(|| User::new(&target));
            if user.level < AccessLevel::Whitelisted {
                user.level = AccessLevel::Whitelisted;
            }
        }
        self.mark_dirty();
        self.say(format!("{} is now whitelisted", target));
    }
}
