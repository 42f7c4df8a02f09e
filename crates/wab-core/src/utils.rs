use rand::seq::SliceRandom;

/// Reactions used for status and auto-react.
pub const REACTION_EMOJIS: [&str; 9] = ["💚", "❤️", "👍", "😊", "🔥", "📣", "🤯", "☠️", "💀"];

pub fn random_reaction() -> &'static str {
    REACTION_EMOJIS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("💚")
}

pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}

/// Split `text` into the first whitespace token and the remaining tokens.
pub fn split_command(text: &str) -> (String, Vec<String>) {
    let mut words = text.split_whitespace();
    let first = words.next().unwrap_or_default().to_string();
    (first, words.map(str::to_string).collect())
}
