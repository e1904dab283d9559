//! Keyboard shortcuts for the recording controls.
//!
//! Bindings are stored as strings like `Ctrl+Shift+S` and parsed into
//! `global_hotkey` hotkeys. Hosts forward key presses to
//! [`ShortcutMap::resolve`], which applies the phase gating, then hand the
//! action to [`apply`].

use anyhow::{anyhow, Result};
use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::engine::{EngineSnapshot, Phase, RecordingEngine};
use crate::settings::Settings;

const MAX_HOTKEY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShortcutAction {
    Start,
    Stop,
    TogglePause,
    Cancel,
    CycleWebcamPosition,
    CycleWebcamSize,
    ToggleWebcamShape,
}

impl ShortcutAction {
    pub fn all() -> &'static [ShortcutAction] {
        &[
            ShortcutAction::Start,
            ShortcutAction::Stop,
            ShortcutAction::TogglePause,
            ShortcutAction::Cancel,
            ShortcutAction::CycleWebcamPosition,
            ShortcutAction::CycleWebcamSize,
            ShortcutAction::ToggleWebcamShape,
        ]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ShortcutAction::Start => "Start recording",
            ShortcutAction::Stop => "Stop recording",
            ShortcutAction::TogglePause => "Pause / resume",
            ShortcutAction::Cancel => "Cancel recording",
            ShortcutAction::CycleWebcamPosition => "Move webcam",
            ShortcutAction::CycleWebcamSize => "Resize webcam",
            ShortcutAction::ToggleWebcamShape => "Toggle webcam shape",
        }
    }

    /// Whether the action does anything in the current state.
    pub fn is_available(&self, snapshot: &EngineSnapshot, settings: &Settings) -> bool {
        match self {
            ShortcutAction::Start => snapshot.phase == Phase::Idle,
            ShortcutAction::Stop | ShortcutAction::TogglePause => snapshot.is_recording(),
            ShortcutAction::Cancel => {
                snapshot.is_recording() || snapshot.phase == Phase::Countdown
            }
            ShortcutAction::CycleWebcamPosition
            | ShortcutAction::CycleWebcamSize
            | ShortcutAction::ToggleWebcamShape => {
                snapshot.is_recording() && snapshot.has_webcam && settings.include_webcam
            }
        }
    }
}

/// Key bindings per action. Every action may have several bindings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShortcutConfig {
    pub start: Vec<String>,
    pub stop: Vec<String>,
    pub toggle_pause: Vec<String>,
    pub cancel: Vec<String>,
    pub cycle_webcam_position: Vec<String>,
    pub cycle_webcam_size: Vec<String>,
    pub toggle_webcam_shape: Vec<String>,
}

fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

impl Default for ShortcutConfig {
    fn default() -> Self {
        Self {
            start: keys(&["R"]),
            stop: keys(&["S"]),
            toggle_pause: keys(&["Space", "P"]),
            cancel: keys(&["Escape"]),
            cycle_webcam_position: keys(&["Up", "Down", "Left", "Right"]),
            cycle_webcam_size: keys(&["="]),
            toggle_webcam_shape: keys(&["C"]),
        }
    }
}

impl ShortcutConfig {
    pub fn bindings(&self, action: ShortcutAction) -> &[String] {
        match action {
            ShortcutAction::Start => &self.start,
            ShortcutAction::Stop => &self.stop,
            ShortcutAction::TogglePause => &self.toggle_pause,
            ShortcutAction::Cancel => &self.cancel,
            ShortcutAction::CycleWebcamPosition => &self.cycle_webcam_position,
            ShortcutAction::CycleWebcamSize => &self.cycle_webcam_size,
            ShortcutAction::ToggleWebcamShape => &self.toggle_webcam_shape,
        }
    }

    fn bindings_mut(&mut self, action: ShortcutAction) -> &mut Vec<String> {
        match action {
            ShortcutAction::Start => &mut self.start,
            ShortcutAction::Stop => &mut self.stop,
            ShortcutAction::TogglePause => &mut self.toggle_pause,
            ShortcutAction::Cancel => &mut self.cancel,
            ShortcutAction::CycleWebcamPosition => &mut self.cycle_webcam_position,
            ShortcutAction::CycleWebcamSize => &mut self.cycle_webcam_size,
            ShortcutAction::ToggleWebcamShape => &mut self.toggle_webcam_shape,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ShortcutMap::from_config(self).map(|_| ())
    }

    /// Drops bindings that do not parse; an action left with none gets its
    /// defaults back.
    pub fn sanitize(&mut self) {
        let defaults = ShortcutConfig::default();
        for &action in ShortcutAction::all() {
            let bindings = self.bindings_mut(action);
            bindings.retain(|b| parse_hotkey(b).is_ok());
            if bindings.is_empty() {
                *bindings = defaults.bindings(action).to_vec();
            }
        }
    }
}

/// Parsed bindings, keyed by hotkey id.
#[derive(Debug, Clone, Default)]
pub struct ShortcutMap {
    bindings: HashMap<u32, ShortcutAction>,
}

impl ShortcutMap {
    pub fn from_config(config: &ShortcutConfig) -> Result<Self> {
        let mut bindings = HashMap::new();
        for &action in ShortcutAction::all() {
            for binding in config.bindings(action) {
                let hotkey = parse_hotkey(binding)?;
                if let Some(previous) = bindings.insert(hotkey.id(), action) {
                    if previous != action {
                        return Err(anyhow!(
                            "{} is bound to both {} and {}",
                            format_hotkey(hotkey.mods, hotkey.key),
                            previous.display_name(),
                            action.display_name()
                        ));
                    }
                }
            }
        }
        Ok(Self { bindings })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// The action bound to `hotkey`, if it is available right now.
    pub fn resolve(
        &self,
        hotkey: &HotKey,
        snapshot: &EngineSnapshot,
        settings: &Settings,
    ) -> Option<ShortcutAction> {
        let action = *self.bindings.get(&hotkey.id())?;
        if action.is_available(snapshot, settings) {
            Some(action)
        } else {
            debug!(action = action.display_name(), phase = %snapshot.phase, "shortcut ignored");
            None
        }
    }
}

/// Runs `action` against the engine.
pub async fn apply(engine: &RecordingEngine, action: ShortcutAction) -> crate::Result<()> {
    match action {
        ShortcutAction::Start => engine.start().await,
        ShortcutAction::Stop => engine.stop(),
        ShortcutAction::TogglePause => engine.toggle_pause(),
        ShortcutAction::Cancel => {
            engine.cancel();
            Ok(())
        }
        ShortcutAction::CycleWebcamPosition => engine.cycle_webcam_position().map(|_| ()),
        ShortcutAction::CycleWebcamSize => engine.cycle_webcam_size().map(|_| ()),
        ShortcutAction::ToggleWebcamShape => engine.toggle_webcam_shape().map(|_| ()),
    }
}

pub fn format_hotkey_string(s: &str) -> String {
    if let Ok(hotkey) = parse_hotkey(s) {
        format_hotkey(hotkey.mods, hotkey.key)
    } else {
        s.to_string()
    }
}

pub fn parse_hotkey(s: &str) -> Result<HotKey> {
    if s.is_empty() || s.len() > MAX_HOTKEY_LEN {
        return Err(anyhow!("Hotkey string must be 1 to {} characters", MAX_HOTKEY_LEN));
    }
    let parts: Vec<&str> = s.split('+').map(|p| p.trim()).collect();

    let mut modifiers = Modifiers::empty();
    let mut key_code: Option<Code> = None;

    for part in parts {
        match part.to_lowercase().as_str() {
            "ctrl" | "control" => modifiers |= Modifiers::CONTROL,
            "alt" => modifiers |= Modifiers::ALT,
            "shift" => modifiers |= Modifiers::SHIFT,
            "super" | "win" | "meta" | "cmd" => modifiers |= Modifiers::SUPER,
            "" => return Err(anyhow!("Empty key in hotkey: {}", s)),
            _ => {
                if key_code.is_some() {
                    return Err(anyhow!("More than one key in hotkey: {}", s));
                }
                key_code = Some(parse_key_code(part)?);
            }
        }
    }

    let code = key_code.ok_or_else(|| anyhow!("No key specified in hotkey"))?;
    let mods = if modifiers.is_empty() { None } else { Some(modifiers) };
    Ok(HotKey::new(mods, code))
}

/// Non-alphanumeric keys the recording controls use, with their display
/// names. Letters, digits and F1-F12 go through `Code`'s own names.
const NAMED_KEYS: &[(&str, Code)] = &[
    ("Space", Code::Space),
    ("Esc", Code::Escape),
    ("Enter", Code::Enter),
    ("=", Code::Equal),
    ("-", Code::Minus),
    ("Up", Code::ArrowUp),
    ("Down", Code::ArrowDown),
    ("Left", Code::ArrowLeft),
    ("Right", Code::ArrowRight),
];

fn parse_key_code(s: &str) -> Result<Code> {
    if let Some((_, code)) = NAMED_KEYS.iter().find(|(name, _)| name.eq_ignore_ascii_case(s)) {
        return Ok(*code);
    }
    let upper = s.to_ascii_uppercase();
    let alias = match upper.as_str() {
        "ESCAPE" => Some(Code::Escape),
        "RETURN" => Some(Code::Enter),
        "EQUAL" | "PLUS" => Some(Code::Equal),
        "MINUS" => Some(Code::Minus),
        _ => None,
    };
    if let Some(code) = alias {
        return Ok(code);
    }

    let mut chars = upper.chars();
    let canonical = match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_uppercase() => format!("Key{}", c),
        (Some(c), None) if c.is_ascii_digit() => format!("Digit{}", c),
        (Some('F'), Some(_)) if upper[1..].parse::<u8>().is_ok_and(|n| (1..=12).contains(&n)) => {
            upper.clone()
        }
        _ => return Err(anyhow!("Unknown key: {}", s)),
    };
    canonical
        .parse::<Code>()
        .map_err(|_| anyhow!("Unknown key: {}", s))
}

pub fn format_hotkey(modifiers: Modifiers, code: Code) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (flag, name) in [
        (Modifiers::CONTROL, "Ctrl"),
        (Modifiers::ALT, "Alt"),
        (Modifiers::SHIFT, "Shift"),
        (Modifiers::SUPER, if cfg!(target_os = "macos") { "Cmd" } else { "Win" }),
    ] {
        if modifiers.contains(flag) {
            parts.push(name.to_string());
        }
    }
    parts.push(format_code(code));
    parts.join("+")
}

/// Display name for a key: `A`, `7`, `F5`, or the named-key label.
pub fn format_code(code: Code) -> String {
    if let Some((name, _)) = NAMED_KEYS.iter().find(|(_, c)| *c == code) {
        return name.to_string();
    }
    let name = code.to_string();
    name.strip_prefix("Key")
        .or_else(|| name.strip_prefix("Digit"))
        .unwrap_or(name.as_str())
        .to_string()
}
