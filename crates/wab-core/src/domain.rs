use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

const USER_SERVER: &str = "s.whatsapp.net";
const GROUP_SERVER: &str = "g.us";
const STATUS_BROADCAST: &str = "status@broadcast";

/// Phone number in international form, digits only (`2348012345678`).
///
/// This is the primary key for settings records, session slots and backups.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Strip everything but ASCII digits; fails when nothing is left.
    pub fn parse(raw: &str) -> Result<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(Error::Config(format!("not a phone number: {raw:?}")));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Personal chat address for this number.
    pub fn jid(&self) -> Jid {
        Jid(format!("{}@{USER_SERVER}", self.0))
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// WhatsApp address (`<user>[:<device>]@<server>`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn status_broadcast() -> Self {
        Self(STATUS_BROADCAST.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_group(&self) -> bool {
        self.server() == GROUP_SERVER
    }

    pub fn is_status_broadcast(&self) -> bool {
        self.0 == STATUS_BROADCAST
    }

    pub fn server(&self) -> &str {
        self.0.split_once('@').map(|(_, s)| s).unwrap_or("")
    }

    /// User part without the device suffix (`123:4@s.whatsapp.net` -> `123`).
    pub fn user(&self) -> &str {
        let user = self.0.split_once('@').map(|(u, _)| u).unwrap_or(&self.0);
        user.split_once(':').map(|(u, _)| u).unwrap_or(user)
    }

    /// Same account, device suffix dropped.
    pub fn normalized(&self) -> Jid {
        let server = self.server();
        if server.is_empty() {
            return self.clone();
        }
        Jid(format!("{}@{server}", self.user()))
    }

    pub fn phone_number(&self) -> Option<PhoneNumber> {
        if self.is_group() || self.is_status_broadcast() {
            return None;
        }
        PhoneNumber::parse(self.user()).ok()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable reference to a message, used for reactions, deletes and read receipts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: Jid,
    pub id: String,
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<Jid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_number_keeps_digits_only() {
        let p = PhoneNumber::parse("+234 801-234-5678").unwrap();
        assert_eq!(p.as_str(), "2348012345678");
        assert_eq!(p.jid().as_str(), "2348012345678@s.whatsapp.net");
        assert!(PhoneNumber::parse("abc").is_err());
    }

    #[test]
    fn jid_strips_device_suffix() {
        let jid = Jid::new("15550001:12@s.whatsapp.net");
        assert_eq!(jid.user(), "15550001");
        assert_eq!(jid.normalized().as_str(), "15550001@s.whatsapp.net");
        assert_eq!(jid.phone_number().unwrap().as_str(), "15550001");
    }

    #[test]
    fn group_and_status_jids_have_no_phone() {
        assert!(Jid::new("1203630@g.us").is_group());
        assert!(Jid::new("1203630@g.us").phone_number().is_none());
        assert!(Jid::status_broadcast().is_status_broadcast());
        assert!(Jid::status_broadcast().phone_number().is_none());
    }
}
