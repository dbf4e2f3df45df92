use std::collections::HashMap;
use thiserror::Error;

use padbot_common::{AccessLevel, Chord, DurationUnit, Input, InputSequence};

use crate::backend::{
    ABS_RX, ABS_RY, ABS_X, ABS_Y, BTN_DPAD_DOWN, BTN_DPAD_LEFT, BTN_DPAD_RIGHT, BTN_DPAD_UP,
    BTN_EAST, BTN_NORTH, BTN_SELECT, BTN_SOUTH, BTN_START, BTN_THUMBL, BTN_THUMBR, BTN_TL,
    BTN_TL2, BTN_TR, BTN_TR2, BTN_WEST,
};

/// What a vocabulary name maps to on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Button(u16),
    /// Signed directional axis entry; `direction` is -1 or +1
    Axis { code: u16, direction: i8 },
    /// Pure delay, presses nothing
    Wait,
}

impl InputKind {
    pub fn is_axis(&self) -> bool {
        matches!(self, InputKind::Axis { .. })
    }
}

/// The installation's valid-input vocabulary
///
/// Keys are lowercase and purely alphabetic except the wait tokens `.` and
/// `#`; digits after a name always start a duration.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    entries: HashMap<String, InputKind>,
}

impl Vocabulary {
    /// The default gamepad vocabulary: face buttons, shoulders, triggers,
    /// start/select, dpad, stick directions and the wait tokens
    pub fn standard() -> Self {
        let mut entries = HashMap::new();

        let buttons = [
            ("a", BTN_SOUTH),
            ("b", BTN_EAST),
            ("x", BTN_WEST),
            ("y", BTN_NORTH),
            ("l", BTN_TL),
            ("r", BTN_TR),
            ("zl", BTN_TL2),
            ("zr", BTN_TR2),
            ("select", BTN_SELECT),
            ("start", BTN_START),
            ("lstick", BTN_THUMBL),
            ("rstick", BTN_THUMBR),
            ("up", BTN_DPAD_UP),
            ("down", BTN_DPAD_DOWN),
            ("left", BTN_DPAD_LEFT),
            ("right", BTN_DPAD_RIGHT),
        ];
        for (name, code) in buttons {
            entries.insert(name.to_string(), InputKind::Button(code));
        }

        let axes = [
            ("lup", ABS_Y, -1),
            ("ldown", ABS_Y, 1),
            ("lleft", ABS_X, -1),
            ("lright", ABS_X, 1),
            ("rup", ABS_RY, -1),
            ("rdown", ABS_RY, 1),
            ("rleft", ABS_RX, -1),
            ("rright", ABS_RX, 1),
        ];
        for (name, code, direction) in axes {
            entries.insert(name.to_string(), InputKind::Axis { code, direction });
        }

        entries.insert(".".to_string(), InputKind::Wait);
        entries.insert("#".to_string(), InputKind::Wait);

        Self { entries }
    }

    pub fn resolve(&self, name: &str) -> Option<InputKind> {
        self.entries.get(&name.to_lowercase()).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    /// Some valid non-wait input name, for macro body test parses
    pub fn sample_input(&self) -> Option<&str> {
        self.entries
            .iter()
            .filter(|(_, kind)| !matches!(kind, InputKind::Wait))
            .map(|(name, _)| name.as_str())
            .min()
    }
}

/// Parse failures, ordered exactly as validation applies them
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The text is ordinary chat, not an input message
    #[error("not an input message")]
    NotAnInput,
    #[error("'{name}' requires {required} access")]
    Blacklisted { name: String, required: AccessLevel },
    #[error("duration {got_ms}ms exceeds the {max_ms}ms limit")]
    DurationExceeded { got_ms: u64, max_ms: u64 },
    #[error("held inputs total {got_ms}ms, over the {max_ms}ms limit")]
    SimultaneousDurationExceeded { got_ms: u64, max_ms: u64 },
    #[error("invalid joystick number {port}, only {count} connected")]
    InvalidPort { port: u64, count: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Everything a parse is a pure function of, besides the text itself
pub struct ParserContext<'a> {
    pub vocabulary: &'a Vocabulary,
    /// Input name -> minimum access level required to use it
    pub blacklist: &'a HashMap<String, AccessLevel>,
    pub user_level: AccessLevel,
    pub port_count: usize,
    pub default_duration: u32,
    pub default_unit: DurationUnit,
    pub frame_ms: u32,
    pub max_input_duration_ms: u64,
    pub max_simultaneous_ms: u64,
}

/// An input plus the raw suffix values validation needs
struct LexedInput {
    input: Input,
    /// Port exactly as typed (1-based), before range validation
    typed_port: Option<u64>,
    /// Percent exactly as typed, before range validation
    typed_percent: Option<u64>,
}

/// Parse expanded chat text into a validated input sequence
pub fn parse(text: &str, ctx: &ParserContext) -> Result<InputSequence, ParseError> {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return Err(ParseError::NotAnInput);
    }

    let steps = lex(&text, ctx)?;
    validate(&steps, ctx)?;

    let chords: Vec<Chord> = steps
        .into_iter()
        .map(|step| Chord {
            inputs: step
                .into_iter()
                .map(|lexed| {
                    let mut input = lexed.input;
                    input.port = lexed.typed_port.map(|p| p as usize - 1);
                    input.percent = lexed.typed_percent.map(|p| p as u8);
                    input
                })
                .collect(),
        })
        .collect();

    let duration_ms = chords.iter().map(|c| c.duration_ms(ctx.frame_ms)).sum();
    Ok(InputSequence {
        steps: chords,
        duration_ms,
    })
}

/// Tokenize the text into steps of simultaneous inputs
///
/// Whitespace separates steps, `+` chords inputs, and a `.` not chained with
/// `+` always begins its own wait step.
fn lex(text: &str, ctx: &ParserContext) -> Result<Vec<Vec<LexedInput>>, ParseError> {
    let mut lexer = Lexer { text, pos: 0 };
    let mut steps = Vec::new();
    let mut step: Vec<LexedInput> = Vec::new();

    loop {
        lexer.skip_whitespace();
        if lexer.at_end() {
            break;
        }

        step.push(lexer.lex_input(ctx)?);

        let after_wait = step
            .last()
            .map(|l| l.input.name == "." || l.input.name == "#")
            .unwrap_or(false);
        match lexer.peek() {
            Some('+') => {
                lexer.bump();
                // A chord member must follow immediately
                match lexer.peek() {
                    Some(c) if !c.is_whitespace() => {}
                    _ => return Err(ParseError::NotAnInput),
                }
            }
            Some(c) if c.is_whitespace() => {
                steps.push(std::mem::take(&mut step));
            }
            // A wait token directly after an input starts its own step
            Some('.') | Some('#') => {
                steps.push(std::mem::take(&mut step));
            }
            // ...and whatever follows a wait token starts one too, so
            // `a.b` plays a, a default-length wait, then b
            Some(c) if c.is_ascii_alphabetic() && after_wait => {
                steps.push(std::mem::take(&mut step));
            }
            None => break,
            Some(_) => return Err(ParseError::NotAnInput),
        }
    }

    if !step.is_empty() {
        steps.push(step);
    }
    if steps.is_empty() {
        return Err(ParseError::NotAnInput);
    }
    Ok(steps)
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn remaining(&self) -> &'a str {
        &self.text[self.pos..]
    }

    /// Consume a digit run, folded saturating into u64
    fn eat_number(&mut self) -> Option<u64> {
        let mut value: u64 = 0;
        let mut any = false;
        while let Some(c) = self.peek() {
            match c.to_digit(10) {
                Some(d) => {
                    value = value.saturating_mul(10).saturating_add(d as u64);
                    any = true;
                    self.bump();
                }
                None => break,
            }
        }
        any.then_some(value)
    }

    /// One input with its suffixes: name, `&port`, duration, `ms`/`s`,
    /// `percent%`, `_` or `-`
    fn lex_input(&mut self, ctx: &ParserContext) -> Result<LexedInput, ParseError> {
        let name = match self.peek() {
            Some(c @ ('.' | '#')) => {
                self.bump();
                c.to_string()
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_alphabetic()) {
                    self.bump();
                }
                self.text[start..self.pos].to_string()
            }
            _ => return Err(ParseError::NotAnInput),
        };
        if !ctx.vocabulary.contains(&name) {
            return Err(ParseError::NotAnInput);
        }

        let mut input = Input {
            name,
            port: None,
            duration: ctx.default_duration,
            unit: ctx.default_unit,
            hold: false,
            release: false,
            percent: None,
        };
        let mut typed_port = None;
        let mut typed_percent = None;
        let mut has_duration = false;
        let mut has_unit = false;
        let mut has_flag = false;

        loop {
            match self.peek() {
                // Ports are a single digit; the pool never exceeds 8, and
                // this keeps `a&2500ms` unambiguous (port 2, duration 500)
                Some('&') if typed_port.is_none() => {
                    self.bump();
                    match self.peek().and_then(|c| c.to_digit(10)) {
                        Some(d) => {
                            self.bump();
                            typed_port = Some(d as u64);
                        }
                        None => return Err(ParseError::NotAnInput),
                    }
                }
                Some(c) if c.is_ascii_digit() => {
                    let value = self.eat_number().ok_or(ParseError::NotAnInput)?;
                    if self.peek() == Some('%') {
                        if typed_percent.is_some() {
                            return Err(ParseError::NotAnInput);
                        }
                        self.bump();
                        typed_percent = Some(value);
                    } else {
                        // Durations are positive
                        if has_duration || value == 0 {
                            return Err(ParseError::NotAnInput);
                        }
                        input.duration = u32::try_from(value).unwrap_or(u32::MAX);
                        has_duration = true;
                    }
                }
                Some('m') if has_duration && !has_unit && self.remaining().starts_with("ms") => {
                    self.bump();
                    self.bump();
                    input.unit = DurationUnit::Millis;
                    has_unit = true;
                }
                Some('s') if has_duration && !has_unit => {
                    self.bump();
                    input.duration = input.duration.saturating_mul(1000);
                    input.unit = DurationUnit::Millis;
                    has_unit = true;
                }
                Some('_') if !has_flag => {
                    self.bump();
                    input.hold = true;
                    has_flag = true;
                }
                Some('-') if !has_flag => {
                    self.bump();
                    input.release = true;
                    has_flag = true;
                }
                _ => break,
            }
        }

        Ok(LexedInput {
            input,
            typed_port,
            typed_percent,
        })
    }
}

/// Apply the validation rules in their fixed order
fn validate(steps: &[Vec<LexedInput>], ctx: &ParserContext) -> Result<(), ParseError> {
    // Blacklisted inputs beyond the issuer's level
    for lexed in steps.iter().flatten() {
        if let Some(required) = ctx.blacklist.get(&lexed.input.name) {
            if ctx.user_level < *required {
                return Err(ParseError::Blacklisted {
                    name: lexed.input.name.clone(),
                    required: *required,
                });
            }
        }
    }

    // Per-input duration cap
    for lexed in steps.iter().flatten() {
        let got_ms = lexed.input.duration_ms(ctx.frame_ms);
        if got_ms > ctx.max_input_duration_ms {
            return Err(ParseError::DurationExceeded {
                got_ms,
                max_ms: ctx.max_input_duration_ms,
            });
        }
    }

    // Hold-flagged inputs stay pressed to sequence end; cap their summed
    // held time
    let step_ms: Vec<u64> = steps
        .iter()
        .map(|step| {
            step.iter()
                .filter(|l| l.input.is_timed())
                .map(|l| l.input.duration_ms(ctx.frame_ms))
                .max()
                .unwrap_or(0)
        })
        .collect();
    let total_ms: u64 = step_ms.iter().sum();
    let mut held_total: u64 = 0;
    let mut elapsed: u64 = 0;
    for (i, step) in steps.iter().enumerate() {
        for lexed in step {
            if lexed.input.hold {
                held_total = held_total.saturating_add(total_ms - elapsed);
            }
        }
        elapsed += step_ms[i];
    }
    if held_total > ctx.max_simultaneous_ms {
        return Err(ParseError::SimultaneousDurationExceeded {
            got_ms: held_total,
            max_ms: ctx.max_simultaneous_ms,
        });
    }

    // Explicit ports must name a connected joystick (1-based as typed)
    for lexed in steps.iter().flatten() {
        if let Some(port) = lexed.typed_port {
            if port < 1 || port > ctx.port_count as u64 {
                return Err(ParseError::InvalidPort {
                    port,
                    count: ctx.port_count,
                });
            }
        }
    }

    // Percent is for axes only, 0-100
    for lexed in steps.iter().flatten() {
        if let Some(percent) = lexed.typed_percent {
            if percent > 100 {
                return Err(ParseError::InvalidInput(format!(
                    "axis percent {} is out of range",
                    percent
                )));
            }
            let kind = ctx.vocabulary.resolve(&lexed.input.name);
            if !matches!(kind, Some(k) if k.is_axis()) {
                return Err(ParseError::InvalidInput(format!(
                    "'{}' is not an axis",
                    lexed.input.name
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        vocabulary: &'a Vocabulary,
        blacklist: &'a HashMap<String, AccessLevel>,
    ) -> ParserContext<'a> {
        ParserContext {
            vocabulary,
            blacklist,
            user_level: AccessLevel::User,
            port_count: 2,
            default_duration: 200,
            default_unit: DurationUnit::Millis,
            frame_ms: 17,
            max_input_duration_ms: 5_000,
            max_simultaneous_ms: 15_000,
        }
    }

    fn parse_ok(text: &str) -> InputSequence {
        let vocabulary = Vocabulary::standard();
        let blacklist = HashMap::new();
        parse(text, &ctx(&vocabulary, &blacklist)).unwrap()
    }

    fn parse_err(text: &str) -> ParseError {
        let vocabulary = Vocabulary::standard();
        let blacklist = HashMap::new();
        parse(text, &ctx(&vocabulary, &blacklist)).unwrap_err()
    }

    #[test]
    fn test_single_input_gets_defaults() {
        let seq = parse_ok("a");
        assert_eq!(seq.steps.len(), 1);
        let input = &seq.steps[0].inputs[0];
        assert_eq!(input.name, "a");
        assert_eq!(input.duration, 200);
        assert_eq!(input.port, None);
        assert_eq!(seq.duration_ms, 200);
    }

    #[test]
    fn test_chord_with_duration() {
        let seq = parse_ok("a+b500ms");
        assert_eq!(seq.steps.len(), 1);
        assert_eq!(seq.steps[0].inputs.len(), 2);
        assert_eq!(seq.steps[0].inputs[0].duration, 200);
        assert_eq!(seq.steps[0].inputs[1].duration, 500);
        // Chord time is its longest member
        assert_eq!(seq.duration_ms, 500);
    }

    #[test]
    fn test_wait_step_with_duration() {
        let seq = parse_ok("a200ms .300ms b");
        assert_eq!(seq.steps.len(), 3);
        assert_eq!(seq.steps[1].inputs[0].name, ".");
        assert_eq!(seq.steps[1].inputs[0].duration, 300);
        assert_eq!(seq.duration_ms, 200 + 300 + 200);
    }

    #[test]
    fn test_dot_after_input_starts_wait_step() {
        let seq = parse_ok("a.b");
        assert_eq!(seq.steps.len(), 3);
        assert_eq!(seq.steps[0].inputs[0].name, "a");
        assert_eq!(seq.steps[1].inputs[0].name, ".");
        assert_eq!(seq.steps[2].inputs[0].name, "b");
    }

    #[test]
    fn test_hash_wait_token() {
        let seq = parse_ok("a #300ms b");
        assert_eq!(seq.steps[1].inputs[0].name, "#");
        assert_eq!(seq.steps[1].inputs[0].duration, 300);
    }

    #[test]
    fn test_seconds_suffix() {
        let seq = parse_ok("a2s");
        assert_eq!(seq.steps[0].inputs[0].duration, 2000);
        assert_eq!(seq.steps[0].inputs[0].unit, DurationUnit::Millis);
    }

    #[test]
    fn test_frame_default_unit() {
        let vocabulary = Vocabulary::standard();
        let blacklist = HashMap::new();
        let mut c = ctx(&vocabulary, &blacklist);
        c.default_unit = DurationUnit::Frames;
        c.default_duration = 12;

        let seq = parse("a", &c).unwrap();
        assert_eq!(seq.steps[0].inputs[0].unit, DurationUnit::Frames);
        assert_eq!(seq.duration_ms, 12 * 17);

        // An explicit ms suffix overrides the frame default
        let seq = parse("a100ms", &c).unwrap();
        assert_eq!(seq.duration_ms, 100);
    }

    #[test]
    fn test_port_suffix() {
        let seq = parse_ok("a&2");
        assert_eq!(seq.steps[0].inputs[0].port, Some(1));

        let seq = parse_ok("a&2500ms");
        assert_eq!(seq.steps[0].inputs[0].port, Some(1));
        assert_eq!(seq.steps[0].inputs[0].duration, 500);
    }

    #[test]
    fn test_hold_and_release_flags() {
        let seq = parse_ok("a_ b a-");
        assert!(seq.steps[0].inputs[0].hold);
        assert!(seq.steps[2].inputs[0].release);
        // Hold and release steps do not add play time of their own
        assert_eq!(seq.duration_ms, 200);
    }

    #[test]
    fn test_axis_percent() {
        let seq = parse_ok("lleft50%");
        assert_eq!(seq.steps[0].inputs[0].percent, Some(50));
    }

    #[test]
    fn test_normal_chat_is_not_an_input() {
        assert_eq!(parse_err("hello everyone"), ParseError::NotAnInput);
        assert_eq!(parse_err("a kappa"), ParseError::NotAnInput);
        assert_eq!(parse_err(""), ParseError::NotAnInput);
        assert_eq!(parse_err("a+"), ParseError::NotAnInput);
        assert_eq!(parse_err("a0"), ParseError::NotAnInput);
    }

    #[test]
    fn test_blacklisted_input() {
        let vocabulary = Vocabulary::standard();
        let mut blacklist = HashMap::new();
        blacklist.insert("start".to_string(), AccessLevel::Moderator);
        let c = ctx(&vocabulary, &blacklist);

        let err = parse("start", &c).unwrap_err();
        assert_eq!(
            err,
            ParseError::Blacklisted {
                name: "start".into(),
                required: AccessLevel::Moderator,
            }
        );

        // Sufficient access passes
        let mut c = ctx(&vocabulary, &blacklist);
        c.user_level = AccessLevel::Moderator;
        assert!(parse("start", &c).is_ok());
    }

    #[test]
    fn test_duration_cap() {
        let err = parse_err("a9000ms");
        assert_eq!(
            err,
            ParseError::DurationExceeded {
                got_ms: 9000,
                max_ms: 5000,
            }
        );
    }

    #[test]
    fn test_simultaneous_duration_cap() {
        // Four holds pressed at the start of a 4s sequence hold 16s total
        let err = parse_err("a_+b_+x_+y_ .4s start-");
        assert!(matches!(
            err,
            ParseError::SimultaneousDurationExceeded { got_ms: 16_000, .. }
        ));
    }

    #[test]
    fn test_invalid_port_number() {
        let err = parse_err("a&3");
        assert_eq!(err, ParseError::InvalidPort { port: 3, count: 2 });
        assert_eq!(
            err.to_string(),
            "invalid joystick number 3, only 2 connected"
        );

        let err = parse_err("a&0");
        assert_eq!(err, ParseError::InvalidPort { port: 0, count: 2 });
    }

    #[test]
    fn test_percent_validation() {
        assert!(matches!(parse_err("lleft150%"), ParseError::InvalidInput(_)));
        // Percent on a button is invalid
        assert!(matches!(parse_err("a50%"), ParseError::InvalidInput(_)));
    }

    #[test]
    fn test_validation_order_blacklist_before_duration() {
        // Both violations present; the blacklist fires first
        let vocabulary = Vocabulary::standard();
        let mut blacklist = HashMap::new();
        blacklist.insert("a".to_string(), AccessLevel::Moderator);
        let c = ctx(&vocabulary, &blacklist);
        assert!(matches!(
            parse("a9000ms", &c),
            Err(ParseError::Blacklisted { .. })
        ));
    }

    #[test]
    fn test_validation_order_duration_before_port() {
        let err = parse_err("a9000ms&7");
        assert!(matches!(err, ParseError::DurationExceeded { .. }));
    }

    #[test]
    fn test_case_insensitive_names() {
        let seq = parse_ok("A+B");
        assert_eq!(seq.steps[0].inputs[0].name, "a");
        assert_eq!(seq.steps[0].inputs[1].name, "b");
    }

    #[test]
    fn test_parse_is_deterministic() {
        let text = "a200ms+b_ .300ms lright80%&2 b-";
        assert_eq!(parse_ok(text), parse_ok(text));
    }
}
