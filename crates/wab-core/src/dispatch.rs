//! Incoming message pipeline.
//!
//! Per message: status broadcast handling, auto-react, anti-link, status
//! saving, command routing (owners only), then presence features. Every step logs and
//! swallows its own failure so one broken call never stops the rest.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    domain::Jid,
    formatting::connected_caption,
    messaging::{
        port::WhatsAppClient,
        types::{CallOffer, IncomingMessage, OutgoingMessage, Presence, QuotedContent},
    },
    plugins::{PluginContext, PluginParams, PluginRegistry},
    security::{contains_link, is_owner},
    services::BotServices,
    session::{SessionEventHandler, SessionHandle},
    settings::UserSettings,
    utils::{random_reaction, split_command},
    Result,
};

const COMMAND_FAILED: &str = "❌ There was an error executing your command.";
const CALL_REJECTED: &str = "*_📞 Auto Reject Call Mode Activated_* \n*_📵 No Calls Allowed_*";
const STATUS_SAVE_TRIGGERS: &[&str] = &["send", "statusdown", "take"];
const QUOTED_TEXT_FALLBACK: &str = "Here is the text message.";

/// Bare `send` / `statusdown` / `take` replies ask for the quoted content.
fn is_status_save_request(text: &str) -> bool {
    let text = text.trim();
    STATUS_SAVE_TRIGGERS
        .iter()
        .any(|t| t.eq_ignore_ascii_case(text))
}

/// Command token and arguments, or `None` when the message is not a command.
///
/// Selections (buttons, list rows, native flows) may omit the prefix; free
/// text must start with it.
pub fn parse_command(message: &IncomingMessage, prefix: &str) -> Option<(String, Vec<String>)> {
    let body = match message.selection_id() {
        Some(id) => {
            let id = id.trim();
            id.strip_prefix(prefix).unwrap_or(id).to_string()
        }
        None => message.text()?.trim_start().strip_prefix(prefix)?.to_string(),
    };
    let (command, args) = split_command(&body);
    if command.is_empty() {
        return None;
    }
    Some((command.to_lowercase(), args))
}

pub struct Dispatcher {
    services: Arc<BotServices>,
    plugins: Arc<PluginRegistry>,
}

impl Dispatcher {
    pub fn new(services: Arc<BotServices>, plugins: Arc<PluginRegistry>) -> Self {
        Self { services, plugins }
    }

    async fn handle_message(&self, session: &SessionHandle, message: IncomingMessage) {
        if message.is_skippable() {
            return;
        }
        let Some(client) = session.client() else {
            tracing::debug!("[DISPATCH] {} has no client, dropping message", session.phone());
            return;
        };
        let settings = self.services.store.get_with_defaults(session.phone()).await;

        if message.chat().is_status_broadcast() {
            self.handle_status(client.as_ref(), &message, &settings).await;
            return;
        }

        if settings.auto_react_enabled && !message.from_me() {
            let reaction = OutgoingMessage::Reaction {
                key: message.key.clone(),
                emoji: random_reaction().to_string(),
            };
            if let Err(e) = client.send(message.chat(), reaction).await {
                tracing::warn!("[DISPATCH] Auto-react failed: {e}");
            }
        }

        if message.is_group()
            && !message.from_me()
            && settings.anti_link
            && message.text().is_some_and(contains_link)
        {
            tracing::info!(
                "[DISPATCH] Deleting link from {} in {}",
                message.sender(),
                message.chat()
            );
            let delete = OutgoingMessage::Delete {
                key: message.key.clone(),
            };
            if let Err(e) = client.send(message.chat(), delete).await {
                tracing::warn!("[DISPATCH] Anti-link delete failed: {e}");
            }
            return;
        }

        if let Some(quoted) = &message.quoted {
            if message.text().is_some_and(is_status_save_request) {
                self.resend_quoted(client.as_ref(), &message, quoted).await;
                return;
            }
        }

        if let Some((command, args)) = parse_command(&message, &settings.prefix) {
            self.run_command(session, &client, &message, &settings, command, args)
                .await;
        }

        if message.is_conversation() {
            self.apply_presence(client.as_ref(), &message, &settings)
                .await;
        }
    }

    /// Send the quoted text, image or video back into the chat.
    async fn resend_quoted(
        &self,
        client: &dyn WhatsAppClient,
        message: &IncomingMessage,
        quoted: &QuotedContent,
    ) {
        let caption = |c: &Option<String>| {
            Some(
                c.clone()
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| format!("> © Created By {}", self.services.cfg.bot_name)),
            )
        };
        let out = match quoted {
            QuotedContent::Text { text } => {
                let text = if text.trim().is_empty() {
                    QUOTED_TEXT_FALLBACK
                } else {
                    text.as_str()
                };
                OutgoingMessage::reply(text, &message.key)
            }
            QuotedContent::Image { url, caption: c } => OutgoingMessage::Image {
                url: url.clone(),
                caption: caption(c),
            },
            QuotedContent::Video { url, caption: c } => OutgoingMessage::Video {
                url: url.clone(),
                caption: caption(c),
            },
            QuotedContent::Unsupported => return,
        };

        tracing::info!(
            "[DISPATCH] Re-sending quoted {} for {} in {}",
            out.kind(),
            message.sender(),
            message.chat()
        );
        if let Err(e) = client.send(message.chat(), out).await {
            tracing::warn!("[DISPATCH] Status save failed: {e}");
        }
    }

    async fn handle_status(
        &self,
        client: &dyn WhatsAppClient,
        message: &IncomingMessage,
        settings: &UserSettings,
    ) {
        let poster = message.sender().clone();
        if settings.status_read_enabled {
            if let Err(e) = client.read_messages(std::slice::from_ref(&message.key)).await {
                tracing::warn!("[STATUS] Read failed: {e}");
            }
            let notice = OutgoingMessage::text(settings.status_read_message.clone());
            if let Err(e) = client.send(&poster, notice).await {
                tracing::warn!("[STATUS] Notice to {poster} failed: {e}");
            }
        }
        if settings.status_react_notify {
            let reaction = OutgoingMessage::Reaction {
                key: message.key.clone(),
                emoji: random_reaction().to_string(),
            };
            if let Err(e) = client.send(&Jid::status_broadcast(), reaction).await {
                tracing::warn!("[STATUS] Reaction to {poster} failed: {e}");
            }
        }
    }

    async fn run_command(
        &self,
        session: &SessionHandle,
        client: &Arc<dyn WhatsAppClient>,
        message: &IncomingMessage,
        settings: &UserSettings,
        command: String,
        args: Vec<String>,
    ) {
        let Some(plugin) = self.plugins.get(&command) else {
            return;
        };
        let sender = if message.from_me() {
            session.own_jid()
        } else {
            message.sender().clone()
        };
        let owner = is_owner(&sender, &session.own_jid(), &self.services.cfg.owner_numbers);
        if !owner {
            tracing::debug!("[DISPATCH] Ignoring {command} from non-owner {sender}");
            return;
        }

        tracing::info!(
            "[DISPATCH] {} ran {}{command} in {}",
            sender,
            settings.prefix,
            message.chat()
        );
        let ctx = PluginContext {
            client: client.clone(),
            message,
            params: PluginParams {
                phone_number: session.phone().clone(),
                chat: message.chat().clone(),
                sender,
                from_me: message.from_me(),
                is_group: message.is_group(),
                push_name: message.push_name.clone(),
                prefix: settings.prefix.clone(),
                query: args.join(" "),
                command: command.clone(),
                args,
                is_owner: owner,
            },
            services: &self.services,
            session,
            plugins: &self.plugins,
        };

        if let Err(e) = plugin.execute(&ctx).await {
            tracing::error!("[DISPATCH] Command {command} failed: {e}");
            if let Err(e) = ctx.reply(COMMAND_FAILED).await {
                tracing::warn!("[DISPATCH] Failure reply not sent: {e}");
            }
        }
    }

    async fn apply_presence(
        &self,
        client: &dyn WhatsAppClient,
        message: &IncomingMessage,
        settings: &UserSettings,
    ) {
        let chat = message.chat();
        let mut steps: Vec<(&str, Result<()>)> = Vec::new();

        if settings.auto_read {
            steps.push((
                "read",
                client.read_messages(std::slice::from_ref(&message.key)).await,
            ));
        }
        if settings.auto_typing {
            steps.push((
                "typing",
                client.send_presence(Presence::Composing, Some(chat)).await,
            ));
        }
        if settings.auto_recording {
            steps.push((
                "recording",
                client.send_presence(Presence::Recording, Some(chat)).await,
            ));
        }
        let online = if settings.always_online {
            Presence::Available
        } else {
            Presence::Unavailable
        };
        steps.push(("online", client.send_presence(online, None).await));

        for (step, res) in steps {
            if let Err(e) = res {
                tracing::warn!("[PRESENCE] {step} failed in {chat}: {e}");
            }
        }
    }

    async fn reject_calls(&self, session: &SessionHandle, offers: Vec<CallOffer>) -> Result<()> {
        let settings = self.services.store.get_with_defaults(session.phone()).await;
        if !settings.anti_call {
            return Ok(());
        }
        let Some(client) = session.client() else {
            return Ok(());
        };

        for offer in offers.into_iter().filter(CallOffer::is_offer) {
            tracing::info!("[CALL] Rejecting call {} from {}", offer.id, offer.from);
            let notice = OutgoingMessage::Text {
                text: CALL_REJECTED.to_string(),
                mentions: vec![offer.from.clone()],
                quoted: None,
            };
            if let Err(e) = client.send(&offer.from, notice).await {
                tracing::warn!("[CALL] Notice to {} failed: {e}", offer.from);
            }
            client.reject_call(&offer.id, &offer.from).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionEventHandler for Dispatcher {
    async fn on_connected(&self, session: &SessionHandle, settings: &UserSettings, first_open: bool) {
        if !first_open {
            return;
        }
        let Some(client) = session.client() else {
            return;
        };
        let cfg = &self.services.cfg;
        let caption = connected_caption(
            &cfg.bot_name,
            &cfg.owner_name,
            &cfg.bot_version,
            self.plugins.len(),
            settings,
        );
        let greeting = match &cfg.greeting_image_url {
            Some(url) => OutgoingMessage::Image {
                url: url.clone(),
                caption: Some(caption),
            },
            None => OutgoingMessage::text(caption),
        };
        if let Err(e) = client.send(&session.own_jid(), greeting).await {
            tracing::warn!("[DISPATCH] Greeting for {} failed: {e}", session.phone());
        }
    }

    async fn on_message(&self, session: &SessionHandle, message: IncomingMessage) {
        self.handle_message(session, message).await;
    }

    async fn on_calls(&self, session: &SessionHandle, offers: Vec<CallOffer>) {
        if let Err(e) = self.reject_calls(session, offers).await {
            tracing::warn!("[CALL] Rejecting calls for {} failed: {e}", session.phone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        domain::MessageKey,
        messaging::types::{GroupMetadata, GroupParticipant, MessageContent, QuotedContent},
        plugins::testing::Fixture,
        settings::SettingsPatch,
        test_support::{phone, text_message},
    };

    const OWNER_CHAT: &str = "13056978303@s.whatsapp.net";
    const STRANGER_CHAT: &str = "15559999@s.whatsapp.net";
    const GROUP: &str = "120363000000@g.us";

    fn dispatcher(fx: &Fixture) -> Dispatcher {
        Dispatcher::new(fx.services.clone(), fx.registry.clone())
    }

    async fn set(fx: &Fixture, patch: SettingsPatch) {
        fx.services
            .store
            .create(&phone("15550001"), &patch)
            .await
            .unwrap();
    }

    fn selection(content: MessageContent) -> IncomingMessage {
        IncomingMessage {
            key: MessageKey {
                remote_jid: Jid::new(OWNER_CHAT),
                id: "SEL".to_string(),
                from_me: false,
                participant: None,
            },
            push_name: None,
            timestamp: None,
            content,
            quoted: None,
        }
    }

    #[test]
    fn commands_share_one_token_space() {
        let text = text_message(OWNER_CHAT, None, false, "  .TagAll hello there");
        assert_eq!(
            parse_command(&text, "."),
            Some(("tagall".to_string(), vec!["hello".into(), "there".into()]))
        );
        assert_eq!(parse_command(&text_message(OWNER_CHAT, None, false, "menu"), "."), None);
        assert_eq!(parse_command(&text_message(OWNER_CHAT, None, false, "."), "."), None);

        let button = selection(MessageContent::ButtonResponse {
            selected_id: "listmenu".to_string(),
        });
        assert_eq!(parse_command(&button, ".").unwrap().0, "listmenu");
        let row = selection(MessageContent::ListResponse {
            selected_row_id: ".antilink status".to_string(),
        });
        assert_eq!(
            parse_command(&row, "."),
            Some(("antilink".to_string(), vec!["status".to_string()]))
        );
        let flow = selection(MessageContent::InteractiveResponse {
            params_json: r#"{"id":"!owner"}"#.to_string(),
        });
        assert_eq!(parse_command(&flow, "!").unwrap().0, "owner");
    }

    #[tokio::test]
    async fn owner_commands_run_and_strangers_are_ignored() {
        let fx = Fixture::new();
        let d = dispatcher(&fx);

        d.on_message(&fx.session, text_message(STRANGER_CHAT, None, false, ".owner"))
            .await;
        assert!(fx.client.sent().is_empty());

        d.on_message(&fx.session, text_message(OWNER_CHAT, None, false, ".owner"))
            .await;
        assert_eq!(fx.client.sent().len(), 2);

        // The bot's own messages count as the owner.
        d.on_message(&fx.session, text_message(STRANGER_CHAT, None, true, ".owner"))
            .await;
        assert_eq!(fx.client.sent().len(), 4);
    }

    #[tokio::test]
    async fn group_admins_who_are_not_owners_cannot_run_group_commands() {
        let fx = Fixture::new();
        fx.client.add_group(GroupMetadata {
            id: Jid::new(GROUP),
            subject: "Testers".to_string(),
            participants: vec![
                GroupParticipant {
                    id: Jid::new(STRANGER_CHAT),
                    admin: Some("admin".to_string()),
                },
                GroupParticipant {
                    id: Jid::new("15550002@s.whatsapp.net"),
                    admin: None,
                },
            ],
        });
        let d = dispatcher(&fx);
        d.on_message(
            &fx.session,
            text_message(GROUP, Some(STRANGER_CHAT), false, ".kickall"),
        )
        .await;
        assert!(fx.client.sent().is_empty());
        assert!(fx.client.recorded.lock().unwrap().participant_updates.is_empty());
    }

    fn quoting(text: &str, quoted: QuotedContent) -> IncomingMessage {
        let mut m = text_message(STRANGER_CHAT, None, false, text);
        m.quoted = Some(quoted);
        m
    }

    #[tokio::test]
    async fn status_save_replies_resend_quoted_content() {
        let fx = Fixture::new();
        let d = dispatcher(&fx);

        d.on_message(
            &fx.session,
            quoting(
                " Send ",
                QuotedContent::Image {
                    url: "https://cdn.example/status.jpg".to_string(),
                    caption: None,
                },
            ),
        )
        .await;
        d.on_message(
            &fx.session,
            quoting(
                "take",
                QuotedContent::Video {
                    url: "https://cdn.example/status.mp4".to_string(),
                    caption: Some("sunset".to_string()),
                },
            ),
        )
        .await;
        d.on_message(
            &fx.session,
            quoting(
                "statusdown",
                QuotedContent::Text {
                    text: "good morning".to_string(),
                },
            ),
        )
        .await;

        let sent = fx.client.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(to, _)| to.as_str() == STRANGER_CHAT));
        assert_eq!(
            sent[0].1,
            OutgoingMessage::Image {
                url: "https://cdn.example/status.jpg".to_string(),
                caption: Some(format!("> © Created By {}", fx.services.cfg.bot_name)),
            }
        );
        assert_eq!(
            sent[1].1,
            OutgoingMessage::Video {
                url: "https://cdn.example/status.mp4".to_string(),
                caption: Some("sunset".to_string()),
            }
        );
        assert!(matches!(
            &sent[2].1,
            OutgoingMessage::Text { text, quoted: Some(_), .. } if text == "good morning"
        ));
    }

    #[tokio::test]
    async fn status_save_needs_trigger_and_quote() {
        let fx = Fixture::new();
        let d = dispatcher(&fx);

        d.on_message(&fx.session, text_message(STRANGER_CHAT, None, false, "send"))
            .await;
        d.on_message(
            &fx.session,
            quoting(
                "send it please",
                QuotedContent::Text {
                    text: "hi".to_string(),
                },
            ),
        )
        .await;
        d.on_message(&fx.session, quoting("send", QuotedContent::Unsupported))
            .await;
        assert!(fx.client.sent().is_empty());
        assert!(is_status_save_request("TAKE"));
        assert!(!is_status_save_request(".send"));
    }

    #[tokio::test]
    async fn plugin_errors_get_the_generic_reply() {
        let fx = Fixture::new();
        let d = dispatcher(&fx);
        // Group metadata lookup fails: the fake knows no groups.
        d.on_message(
            &fx.session,
            text_message(GROUP, Some(OWNER_CHAT), false, ".tagall"),
        )
        .await;
        assert_eq!(fx.client.sent_texts(), vec![COMMAND_FAILED.to_string()]);
    }

    #[tokio::test]
    async fn anti_link_deletes_and_stops() {
        let fx = Fixture::new();
        set(
            &fx,
            SettingsPatch {
                anti_link: Some(true),
                always_online: Some(true),
                ..Default::default()
            },
        )
        .await;
        let d = dispatcher(&fx);
        d.on_message(
            &fx.session,
            text_message(GROUP, Some(STRANGER_CHAT), false, "join www.spam.example now"),
        )
        .await;

        let sent = fx.client.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1, OutgoingMessage::Delete { .. }));
        assert!(fx.client.recorded.lock().unwrap().presences.is_empty());

        // Links from the bot itself are left alone.
        d.on_message(
            &fx.session,
            text_message(GROUP, None, true, "see https://example.com"),
        )
        .await;
        assert_eq!(fx.client.sent().len(), 1);
    }

    #[tokio::test]
    async fn status_updates_are_read_and_reacted_to() {
        let fx = Fixture::new();
        let d = dispatcher(&fx);
        d.on_message(
            &fx.session,
            text_message("status@broadcast", Some(STRANGER_CHAT), false, "my status"),
        )
        .await;

        let rec = fx.client.recorded.lock().unwrap();
        assert_eq!(rec.read.len(), 1);
        assert_eq!(rec.sent.len(), 2);
        assert_eq!(rec.sent[0].0.as_str(), STRANGER_CHAT);
        assert_eq!(
            rec.sent[0].1,
            OutgoingMessage::text("Your Status has been read")
        );
        assert_eq!(rec.sent[1].0, Jid::status_broadcast());
        assert!(matches!(rec.sent[1].1, OutgoingMessage::Reaction { .. }));
        assert!(rec.presences.is_empty());
    }

    #[tokio::test]
    async fn presence_features_follow_settings() {
        let fx = Fixture::new();
        set(
            &fx,
            SettingsPatch {
                auto_read: Some(true),
                auto_typing: Some(true),
                auto_react_enabled: Some(true),
                ..Default::default()
            },
        )
        .await;
        let d = dispatcher(&fx);
        d.on_message(&fx.session, text_message(STRANGER_CHAT, None, false, "hi"))
            .await;

        let rec = fx.client.recorded.lock().unwrap();
        assert_eq!(rec.read.len(), 1);
        assert_eq!(
            rec.presences,
            vec![
                (Presence::Composing, Some(Jid::new(STRANGER_CHAT))),
                (Presence::Unavailable, None),
            ]
        );
        assert!(matches!(rec.sent[0].1, OutgoingMessage::Reaction { .. }));
    }

    #[tokio::test]
    async fn calls_are_rejected_only_with_anti_call() {
        let fx = Fixture::new();
        let d = dispatcher(&fx);
        let offers = vec![
            CallOffer {
                id: "c1".to_string(),
                from: Jid::new(STRANGER_CHAT),
                status: "offer".to_string(),
            },
            CallOffer {
                id: "c2".to_string(),
                from: Jid::new(STRANGER_CHAT),
                status: "terminate".to_string(),
            },
        ];
        d.on_calls(&fx.session, offers.clone()).await;
        assert!(fx.client.recorded.lock().unwrap().rejected.is_empty());

        set(
            &fx,
            SettingsPatch {
                anti_call: Some(true),
                ..Default::default()
            },
        )
        .await;
        d.on_calls(&fx.session, offers).await;
        let rec = fx.client.recorded.lock().unwrap();
        assert_eq!(rec.rejected, vec!["c1".to_string()]);
        let OutgoingMessage::Text { text, mentions, .. } = &rec.sent[0].1 else {
            panic!("expected notice");
        };
        assert_eq!(text, CALL_REJECTED);
        assert_eq!(mentions, &vec![Jid::new(STRANGER_CHAT)]);
    }

    #[tokio::test]
    async fn greeting_only_on_first_open() {
        let fx = Fixture::new();
        let d = dispatcher(&fx);
        let settings = UserSettings::defaults(phone("15550001"));

        d.on_connected(&fx.session, &settings, false).await;
        assert!(fx.client.sent().is_empty());

        d.on_connected(&fx.session, &settings, true).await;
        let sent = fx.client.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, fx.session.own_jid());
        assert!(fx.client.sent_texts()[0].contains("*`◦ Total Plugins:`* 9"));

        fx.client.fail_sends.store(true, Ordering::SeqCst);
        d.on_connected(&fx.session, &settings, true).await;
    }
}
