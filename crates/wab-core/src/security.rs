use std::sync::OnceLock;

use regex::Regex;

use crate::domain::Jid;

// ============== Ownership ==============

/// Commands are accepted from the bot's own account or a configured owner number.
pub fn is_owner(sender: &Jid, own: &Jid, owner_numbers: &[String]) -> bool {
    let sender = sender.user();
    if sender.is_empty() {
        return false;
    }
    sender == own.user() || owner_numbers.iter().any(|n| n == sender)
}

// ============== Link Detection ==============

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(https?://\S+|www\.\S+|[a-z0-9.-]+\.(com|net|org|edu|gov|co\.uk|co\.in|co\.za)\b)",
        )
        .expect("valid regex")
    })
}

/// URLs, `www.` hosts and bare domains on common TLDs.
pub fn contains_link(text: &str) -> bool {
    link_regex().is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_is_self_or_configured() {
        let own = Jid::new("15550001:3@s.whatsapp.net");
        let owners = vec!["13056978303".to_string()];
        assert!(is_owner(&Jid::new("15550001@s.whatsapp.net"), &own, &owners));
        assert!(is_owner(&Jid::new("13056978303@s.whatsapp.net"), &own, &owners));
        assert!(!is_owner(&Jid::new("19990000@s.whatsapp.net"), &own, &owners));
        assert!(!is_owner(&Jid::new("@s.whatsapp.net"), &Jid::new(""), &[]));
    }

    #[test]
    fn link_detection() {
        assert!(contains_link("see https://example.test/x"));
        assert!(contains_link("go to WWW.example.test"));
        assert!(contains_link("join chat at shop.co.uk now"));
        assert!(contains_link("example.com"));
        assert!(!contains_link("no links here, just text."));
        assert!(!contains_link("version 1.2.3"));
    }
}
