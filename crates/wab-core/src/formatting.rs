//! WhatsApp text formatting helpers (captions, summaries, durations).

use std::time::Duration;

use crate::settings::UserSettings;

const SEPARATOR_WIDTH: usize = 25;

pub fn separator() -> String {
    "━".repeat(SEPARATOR_WIDTH)
}

/// WhatsApp bold.
pub fn bold(text: &str) -> String {
    format!("*{text}*")
}

/// WhatsApp inline monospace.
pub fn monospace(text: &str) -> String {
    format!("`{text}`")
}

/// Upper-cased Unicode monospace (`menu` -> `𝙼𝙴𝙽𝚄`); other characters pass through.
pub fn to_monospace(text: &str) -> String {
    text.chars()
        .map(|c| {
            let c = c.to_ascii_uppercase();
            let mapped = match c {
                'A'..='Z' => char::from_u32(0x1D670 + (c as u32 - 'A' as u32)),
                '0'..='9' => char::from_u32(0x1D7F6 + (c as u32 - '0' as u32)),
                _ => None,
            };
            mapped.unwrap_or(c)
        })
        .collect()
}

/// `3d 4h 5m 6s`, leading zero units dropped.
pub fn format_uptime(d: Duration) -> String {
    let total = d.as_secs();
    let (days, hours, mins, secs) = (
        total / 86_400,
        (total % 86_400) / 3_600,
        (total % 3_600) / 60,
        total % 60,
    );

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if days > 0 || hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if days > 0 || hours > 0 || mins > 0 {
        parts.push(format!("{mins}m"));
    }
    parts.push(format!("{secs}s"));
    parts.join(" ")
}

pub fn format_bytes(n: u64) -> String {
    const KB: f64 = 1024.0;
    let n = n as f64;
    if n < KB {
        format!("{n} B")
    } else if n < KB * KB {
        format!("{:.1} KB", n / KB)
    } else {
        format!("{:.1} MB", n / (KB * KB))
    }
}

fn on_off(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

/// One `*◦ key:* value` line per user-facing setting.
pub fn settings_summary(s: &UserSettings) -> String {
    let rows: [(&str, String); 10] = [
        ("statusReadMessage", s.status_read_message.clone()),
        ("statusReadEnabled", on_off(s.status_read_enabled).into()),
        ("autoReactEnabled", on_off(s.auto_react_enabled).into()),
        ("autoTyping", on_off(s.auto_typing).into()),
        ("autoRead", on_off(s.auto_read).into()),
        ("autoRecording", on_off(s.auto_recording).into()),
        ("antiCall", on_off(s.anti_call).into()),
        ("alwaysOnline", on_off(s.always_online).into()),
        ("prefix", s.prefix.clone()),
        ("statusReactNotify", on_off(s.status_react_notify).into()),
    ];
    rows.iter()
        .map(|(k, v)| format!("*◦ {k}:* {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Greeting sent to the bot's own chat after the first successful connection.
pub fn connected_caption(
    bot_name: &str,
    owner_name: &str,
    version: &str,
    plugin_count: usize,
    settings: &UserSettings,
) -> String {
    let sep = separator();
    format!(
        "{sep}\n*`◦ Successfully Connected To {bot_name} Type {prefix}menu To see menu list 😚 `*\n\
         *`◦ Developer:`* {owner_name}\n*`◦ Version:`* {version}\n\n\
         *`◦ Total Plugins:`* {plugin_count}\n\n*`◦ User Settings:`*\n{summary}\n{sep}",
        prefix = settings.prefix,
        summary = settings_summary(settings),
    )
}
