use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use padbot_common::{macro_key_arity, MacroDef};

/// Prefix that marks a macro invocation in chat text
pub const MACRO_SIGIL: char = '#';
/// Maximum number of nested expansion passes
pub const MAX_EXPANSION_DEPTH: usize = 10;
/// Maximum stored key length, sigil and parameter marker included
pub const MAX_MACRO_KEY_LEN: usize = 50;

/// Macro expansion failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExpansionError {
    #[error("macro {0} refers to itself")]
    Cycle(String),
    #[error("macro expansion exceeded depth {MAX_EXPANSION_DEPTH}")]
    DepthExceeded,
    #[error("macro {name} takes {expected} arguments, got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("unknown macro {0}")]
    UnknownMacro(String),
    #[error("malformed macro invocation near '{0}'")]
    MalformedInvocation(String),
}

/// Macro store mutation failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MacroStoreError {
    #[error("macro keys start with '{MACRO_SIGIL}' followed by a letter or digit")]
    InvalidKey,
    #[error("macro keys are limited to {MAX_MACRO_KEY_LEN} characters")]
    KeyTooLong,
    #[error("malformed parameter marker, expected e.g. #name(*,*)")]
    BadParameterMarker,
}

/// In-memory name -> expansion mapping with a first-char index
///
/// The index groups macro names by their second character (the first is the
/// sigil), each bucket sorted longest-first, so expansion can match the
/// longest name without scanning the whole map. It is rebuilt incrementally
/// on every mutation and stays consistent with the map at quiescent points.
#[derive(Default)]
pub struct MacroStore {
    macros: HashMap<String, MacroDef>,
    index: HashMap<char, Vec<String>>,
    persist_tx: Option<mpsc::Sender<()>>,
}

impl MacroStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel notified on every mutation; the host wires it to persistence
    pub fn set_persist_channel(&mut self, tx: mpsc::Sender<()>) {
        self.persist_tx = Some(tx);
    }

    fn notify_persist(&self) {
        if let Some(tx) = &self.persist_tx {
            // Coalesce: a full channel already has a save pending
            let _ = tx.try_send(());
        }
    }

    /// Validate a key's shape: sigil, alphanumeric second char, length cap,
    /// and a well-formed `(*,*)` marker when present
    pub fn validate_key(key: &str) -> Result<(), MacroStoreError> {
        let mut chars = key.chars();
        if chars.next() != Some(MACRO_SIGIL) {
            return Err(MacroStoreError::InvalidKey);
        }
        match chars.next() {
            Some(c) if c.is_ascii_alphanumeric() => {}
            _ => return Err(MacroStoreError::InvalidKey),
        }
        if key.chars().count() > MAX_MACRO_KEY_LEN {
            return Err(MacroStoreError::KeyTooLong);
        }

        if let Some(open) = key.find('(') {
            let marker = &key[open..];
            let inner = marker
                .strip_prefix('(')
                .and_then(|m| m.strip_suffix(')'))
                .ok_or(MacroStoreError::BadParameterMarker)?;
            if inner.is_empty() || !inner.split(',').all(|p| p == "*") {
                return Err(MacroStoreError::BadParameterMarker);
            }
            // Nothing before the marker besides the name
            if key[1..open].chars().any(|c| !c.is_ascii_alphanumeric()) {
                return Err(MacroStoreError::InvalidKey);
            }
        } else if key[1..].chars().any(|c| !c.is_ascii_alphanumeric()) {
            return Err(MacroStoreError::InvalidKey);
        }

        Ok(())
    }

    /// Insert or replace a macro definition
    pub fn insert(&mut self, key: &str, body: &str) -> Result<(), MacroStoreError> {
        let key = key.to_lowercase();
        Self::validate_key(&key)?;

        let def = MacroDef {
            key: key.clone(),
            body: body.to_lowercase(),
            params: macro_key_arity(&key),
        };
        let name = def.name().to_string();

        self.macros.insert(key, def);
        self.index_add(&name);
        self.notify_persist();
        info!("Stored macro {}", name);
        Ok(())
    }

    /// Remove every definition invocable as `name`, returning whether any
    /// existed
    pub fn remove_by_name(&mut self, name: &str) -> bool {
        let name = name.to_lowercase();
        let keys: Vec<String> = self
            .macros
            .values()
            .filter(|def| def.name() == name)
            .map(|def| def.key.clone())
            .collect();
        if keys.is_empty() {
            return false;
        }

        for key in keys {
            self.macros.remove(&key);
        }
        self.index_remove(&name);
        self.notify_persist();
        info!("Removed macro {}", name);
        true
    }

    /// Find a definition by invocable name and arity
    pub fn lookup(&self, name: &str, arity: usize) -> Option<&MacroDef> {
        self.macros
            .values()
            .find(|def| def.name() == name && def.params == arity)
    }

    /// Whether any dynamic definition is invocable as `name`
    pub fn has_dynamic(&self, name: &str) -> bool {
        self.macros
            .values()
            .any(|def| def.name() == name && def.is_dynamic())
    }

    /// Largest declared arity among definitions invocable as `name`
    pub fn expected_arity(&self, name: &str) -> usize {
        self.macros
            .values()
            .filter(|def| def.name() == name)
            .map(|def| def.params)
            .max()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MacroDef> {
        self.macros.values()
    }

    /// Replace the whole store, e.g. after loading persisted data
    pub fn replace_all(&mut self, defs: Vec<MacroDef>) {
        self.macros.clear();
        self.index.clear();
        for def in defs {
            let name = def.name().to_string();
            self.macros.insert(def.key.clone(), def);
            self.index_add(&name);
        }
    }

    /// Longest stored name matching a prefix of `text` (which starts at the
    /// sigil)
    fn match_longest(&self, text: &str) -> Option<&str> {
        let first = text.chars().nth(1)?;
        let bucket = self.index.get(&first)?;
        bucket
            .iter()
            .find(|name| text.starts_with(name.as_str()))
            .map(|name| name.as_str())
    }

    fn index_add(&mut self, name: &str) {
        let first = match name.chars().nth(1) {
            Some(c) => c,
            None => return,
        };
        let bucket = self.index.entry(first).or_default();
        if !bucket.iter().any(|n| n == name) {
            bucket.push(name.to_string());
            // Longest-first keeps prefix matching greedy
            bucket.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        }
    }

    fn index_remove(&mut self, name: &str) {
        let first = match name.chars().nth(1) {
            Some(c) => c,
            None => return,
        };
        if let Some(bucket) = self.index.get_mut(&first) {
            bucket.retain(|n| n != name);
            if bucket.is_empty() {
                self.index.remove(&first);
            }
        }
    }

    #[cfg(test)]
    fn index_is_consistent(&self) -> bool {
        let mut names: Vec<&str> = self.macros.values().map(|d| d.name()).collect();
        names.sort_unstable();
        names.dedup();
        let mut indexed: Vec<&str> = self
            .index
            .values()
            .flat_map(|b| b.iter().map(|n| n.as_str()))
            .collect();
        indexed.sort_unstable();
        names == indexed
    }
}

/// Expand every macro invocation in `text`
///
/// The text is lowercased first; matching is longest-prefix via the store
/// index. A sigil not followed by an alphanumeric character is the wait token
/// and passes through untouched.
pub fn expand(store: &MacroStore, text: &str) -> Result<String, ExpansionError> {
    let text = text.to_lowercase();
    let mut active = HashSet::new();
    expand_inner(store, &text, &mut active, 0)
}

fn expand_inner(
    store: &MacroStore,
    text: &str,
    active: &mut HashSet<String>,
    depth: usize,
) -> Result<String, ExpansionError> {
    if depth > MAX_EXPANSION_DEPTH {
        return Err(ExpansionError::DepthExceeded);
    }

    let mut out = String::new();
    let mut rest = text;

    while let Some(pos) = rest.find(MACRO_SIGIL) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        let after_sigil = rest[1..].chars().next();
        if !after_sigil.map(|c| c.is_ascii_alphanumeric()).unwrap_or(false) {
            // Wait token, not an invocation
            out.push(MACRO_SIGIL);
            rest = &rest[1..];
            continue;
        }

        let name = match store.match_longest(rest) {
            Some(name) => name.to_string(),
            None => {
                // A sigil followed by digits is the wait token with a
                // duration suffix; anything else is an unknown macro
                if rest[1..].starts_with(|c: char| c.is_ascii_digit()) {
                    out.push(MACRO_SIGIL);
                    rest = &rest[1..];
                    continue;
                }
                let word: String = rest[1..]
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric())
                    .collect();
                return Err(ExpansionError::UnknownMacro(format!("#{}", word)));
            }
        };
        rest = &rest[name.len()..];

        // Argument list, when present and expected
        let mut args: Vec<String> = Vec::new();
        if store.has_dynamic(&name) && rest.starts_with('(') {
            let (raw_args, consumed) = read_arguments(rest, &name)?;
            rest = &rest[consumed..];
            for raw in raw_args {
                args.push(expand_inner(store, raw.trim(), active, depth + 1)?);
            }
        } else if store.lookup(&name, 0).is_none() {
            // Only dynamic definitions exist and no argument list follows
            return Err(ExpansionError::MalformedInvocation(name.clone()));
        }

        let def = store.lookup(&name, args.len()).ok_or_else(|| {
            ExpansionError::ArityMismatch {
                name: name.clone(),
                expected: store.expected_arity(&name),
                got: args.len(),
            }
        })?;

        let body = substitute_placeholders(&def.body, &name, &args)?;

        if !active.insert(name.clone()) {
            return Err(ExpansionError::Cycle(name));
        }
        let expanded = expand_inner(store, &body, active, depth + 1)?;
        active.remove(&name);

        debug!("Expanded {} -> {}", name, expanded);
        out.push_str(&expanded);
    }

    out.push_str(rest);
    Ok(out)
}

/// Read a parenthesized comma-separated argument list starting at `text[0]`
///
/// Returns the raw argument fragments and the byte length consumed, honoring
/// nested parentheses from nested dynamic invocations.
fn read_arguments<'t>(
    text: &'t str,
    name: &str,
) -> Result<(Vec<&'t str>, usize), ExpansionError> {
    let mut args = Vec::new();
    let mut nesting = 0usize;
    let mut arg_start = 1;

    for (i, c) in text.char_indices() {
        match c {
            '(' => nesting += 1,
            ')' => {
                nesting -= 1;
                if nesting == 0 {
                    args.push(&text[arg_start..i]);
                    return Ok((args, i + 1));
                }
            }
            ',' if nesting == 1 => {
                args.push(&text[arg_start..i]);
                arg_start = i + 1;
            }
            _ => {}
        }
    }

    Err(ExpansionError::MalformedInvocation(name.to_string()))
}

/// Replace `<0>`..`<k-1>` with the expanded arguments
fn substitute_placeholders(
    body: &str,
    name: &str,
    args: &[String],
) -> Result<String, ExpansionError> {
    let mut out = body.to_string();
    for (i, arg) in args.iter().enumerate() {
        out = out.replace(&format!("<{}>", i), arg);
    }

    // A placeholder beyond the supplied arguments means the body wants more
    if let Some(open) = out.find('<') {
        let tail = &out[open + 1..];
        if let Some(close) = tail.find('>') {
            if tail[..close].chars().all(|c| c.is_ascii_digit()) && close > 0 {
                return Err(ExpansionError::ArityMismatch {
                    name: name.to_string(),
                    expected: args.len() + 1,
                    got: args.len(),
                });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(defs: &[(&str, &str)]) -> MacroStore {
        let mut store = MacroStore::new();
        for (key, body) in defs {
            store.insert(key, body).unwrap();
        }
        store
    }

    #[test]
    fn test_static_expansion() {
        let store = store_with(&[("#combo", "a+b .200 start")]);
        assert_eq!(expand(&store, "#combo").unwrap(), "a+b .200 start");
    }

    #[test]
    fn test_expansion_is_lowercased() {
        let store = store_with(&[("#combo", "a b")]);
        assert_eq!(expand(&store, "#COMBO").unwrap(), "a b");
    }

    #[test]
    fn test_longest_prefix_match_wins() {
        let store = store_with(&[("#a", "left"), ("#ab", "right")]);
        assert_eq!(expand(&store, "#ab").unwrap(), "right");
        assert_eq!(expand(&store, "#a").unwrap(), "left");
    }

    #[test]
    fn test_nested_expansion() {
        let store = store_with(&[("#inner", "a"), ("#outer", "#inner b")]);
        assert_eq!(expand(&store, "#outer").unwrap(), "a b");
    }

    #[test]
    fn test_dynamic_macro_expansion() {
        let store = store_with(&[("#smash(*,*)", "<0>+<1>")]);
        assert_eq!(expand(&store, "#smash(left,right)").unwrap(), "left+right");
    }

    #[test]
    fn test_dynamic_arguments_expand_recursively() {
        let store = store_with(&[("#smash(*,*)", "<0>+<1>"), ("#l", "left")]);
        assert_eq!(expand(&store, "#smash(#l,right)").unwrap(), "left+right");
    }

    #[test]
    fn test_arity_mismatch() {
        let store = store_with(&[("#smash(*,*)", "<0>+<1>")]);
        assert!(matches!(
            expand(&store, "#smash(left)"),
            Err(ExpansionError::ArityMismatch { expected: 2, got: 1, .. })
        ));
    }

    #[test]
    fn test_missing_argument_list_is_malformed() {
        let store = store_with(&[("#smash(*,*)", "<0>+<1>")]);
        assert!(matches!(
            expand(&store, "#smash left right"),
            Err(ExpansionError::MalformedInvocation(_))
        ));
    }

    #[test]
    fn test_unterminated_argument_list_is_malformed() {
        let store = store_with(&[("#smash(*,*)", "<0>+<1>")]);
        assert!(matches!(
            expand(&store, "#smash(left,right"),
            Err(ExpansionError::MalformedInvocation(_))
        ));
    }

    #[test]
    fn test_direct_cycle_detected() {
        let store = store_with(&[("#loop", "#loop")]);
        assert_eq!(
            expand(&store, "#loop"),
            Err(ExpansionError::Cycle("#loop".into()))
        );
    }

    #[test]
    fn test_indirect_cycle_detected() {
        let store = store_with(&[("#x", "#y"), ("#y", "#x")]);
        assert!(matches!(expand(&store, "#x"), Err(ExpansionError::Cycle(_))));
    }

    #[test]
    fn test_depth_limit() {
        // A linear chain one deeper than the limit, no cycle involved
        let mut store = MacroStore::new();
        for i in 0..=MAX_EXPANSION_DEPTH {
            store
                .insert(&format!("#d{}", i), &format!("#d{}", i + 1))
                .unwrap();
        }
        store
            .insert(&format!("#d{}", MAX_EXPANSION_DEPTH + 1), "a")
            .unwrap();
        assert_eq!(expand(&store, "#d0"), Err(ExpansionError::DepthExceeded));
    }

    #[test]
    fn test_unknown_macro() {
        let store = MacroStore::new();
        assert_eq!(
            expand(&store, "#nope"),
            Err(ExpansionError::UnknownMacro("#nope".into()))
        );
    }

    #[test]
    fn test_bare_sigil_is_wait_token() {
        let store = MacroStore::new();
        assert_eq!(expand(&store, "a # b").unwrap(), "a # b");
        // Digits after the sigil are a wait duration, not a macro name
        assert_eq!(expand(&store, "#300 a").unwrap(), "#300 a");
        assert_eq!(
            expand(&store, "#typo").unwrap_err(),
            ExpansionError::UnknownMacro("#typo".into())
        );
    }

    #[test]
    fn test_key_validation() {
        assert!(MacroStore::validate_key("#combo").is_ok());
        assert!(MacroStore::validate_key("#smash(*,*)").is_ok());
        assert!(MacroStore::validate_key("combo").is_err());
        assert!(MacroStore::validate_key("#(").is_err());
        assert!(MacroStore::validate_key("#smash(left)").is_err());
        let long = format!("#{}", "x".repeat(MAX_MACRO_KEY_LEN));
        assert!(MacroStore::validate_key(&long).is_err());
    }

    #[test]
    fn test_index_stays_consistent() {
        let mut store = store_with(&[("#a", "left"), ("#ab", "right"), ("#ba", "up")]);
        assert!(store.index_is_consistent());

        store.remove_by_name("#ab");
        assert!(store.index_is_consistent());
        assert!(store.lookup("#ab", 0).is_none());
        assert!(store.lookup("#a", 0).is_some());

        store.remove_by_name("#a");
        store.remove_by_name("#ba");
        assert!(store.index_is_consistent());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_mutations_signal_persistence() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut store = MacroStore::new();
        store.set_persist_channel(tx);

        store.insert("#combo", "a b").unwrap();
        store.remove_by_name("#combo");

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }
}
