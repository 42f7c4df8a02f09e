use async_trait::async_trait;
use chrono::Utc;

use super::{Plugin, PluginContext};
use crate::{
    domain::Jid,
    messaging::types::{GroupMetadata, OutgoingMessage, ParticipantAction},
    settings::SettingsPatch,
    Result,
};

/// Group metadata, or a refusal reply and `None` outside groups.
///
/// Only owners reach plugins; the dispatcher drops everyone else.
async fn current_group(ctx: &PluginContext<'_>) -> Result<Option<GroupMetadata>> {
    if !ctx.params.is_group {
        ctx.reply("❌ This command can only be used in groups!").await?;
        return Ok(None);
    }
    Ok(Some(ctx.client.group_metadata(&ctx.params.chat).await?))
}

fn at(jid: &Jid) -> String {
    format!("@{}", jid.user())
}

pub struct TagAllPlugin;

#[async_trait]
impl Plugin for TagAllPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["tagall", "everyone", "all", "mentionall"]
    }

    fn category(&self) -> &'static str {
        "Group"
    }

    fn description(&self) -> &'static str {
        "Tag all members in the group (with optional message)"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        let Some(meta) = current_group(ctx).await? else {
            return Ok(());
        };
        let members: Vec<Jid> = meta.participants.iter().map(|p| p.id.clone()).collect();
        if members.is_empty() {
            ctx.reply("❌ No members found in this group!").await?;
            return Ok(());
        }

        let message = if ctx.params.query.trim().is_empty() {
            "Everyone!"
        } else {
            ctx.params.query.trim()
        };
        let mut text = format!(
            "╭───「 *TAG ALERT* 」───╮\n\n\
             📢 *Message:* {message}\n\
             👤 *By:* {}\n\
             👥 *Members:* {}\n\
             🏷️ *Group:* {}\n\
             ⏰ *Time:* {}\n\n\
             *Tagged Members:* \n",
            at(&ctx.params.sender),
            members.len(),
            meta.subject,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        );
        for (idx, member) in members.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", idx + 1, at(member)));
        }
        let by = ctx.params.push_name.as_deref().unwrap_or("someone");
        text.push_str(&format!(
            "\n> *© Tagged by {by} using {}*",
            ctx.services.cfg.bot_name
        ));

        ctx.send(OutgoingMessage::Text {
            text,
            mentions: members,
            quoted: Some(ctx.message.key.clone()),
        })
        .await?;
        ctx.react("✅").await
    }
}

pub struct KickAllPlugin;

#[async_trait]
impl Plugin for KickAllPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["kickall", "removeall", "cleargroup"]
    }

    fn category(&self) -> &'static str {
        "Group"
    }

    fn description(&self) -> &'static str {
        "Remove all non-admin members from the group"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        let Some(meta) = current_group(ctx).await? else {
            return Ok(());
        };
        let bot = ctx.session.own_jid();
        let targets: Vec<Jid> = meta
            .participants
            .iter()
            .filter(|p| !p.is_admin() && p.id.user() != bot.user())
            .map(|p| p.id.clone())
            .collect();
        if targets.is_empty() {
            ctx.reply("❌ No members to remove (all are admins or bot).")
                .await?;
            return Ok(());
        }

        let count = targets.len();
        ctx.reply(format!(
            "⚠️ *WARNING* ⚠️\n\nRemoving *{count}* members at once..."
        ))
        .await?;
        ctx.client
            .group_participants_update(&ctx.params.chat, &targets, ParticipantAction::Remove)
            .await?;
        ctx.send(OutgoingMessage::Text {
            text: format!(
                "✅ Successfully removed *{count}* members.\n\n> *Executed by:* {}",
                at(&ctx.params.sender)
            ),
            mentions: vec![ctx.params.sender.clone()],
            quoted: Some(ctx.message.key.clone()),
        })
        .await
    }
}

pub struct AntiLinkPlugin;

#[async_trait]
impl Plugin for AntiLinkPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["antilink"]
    }

    fn category(&self) -> &'static str {
        "Admin"
    }

    fn description(&self) -> &'static str {
        "Toggle antilink on/off; links are deleted without banning users"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        if !ctx.params.is_group {
            ctx.reply("❌ This command can only be used in groups.").await?;
            return Ok(());
        }

        let prefix = &ctx.params.prefix;
        let action = ctx.params.args.first().map(|a| a.to_lowercase());
        let store = &ctx.services.store;
        let phone = &ctx.params.phone_number;
        match action.as_deref() {
            Some(v @ ("on" | "off")) => {
                let enabled = v == "on";
                let patch = SettingsPatch {
                    anti_link: Some(enabled),
                    ..Default::default()
                };
                store.create(phone, &patch).await?;
                ctx.reply(if enabled {
                    "✅ Antilink has been *enabled*. Links will be automatically deleted."
                } else {
                    "✅ Antilink has been *disabled*. Links will not be deleted."
                })
                .await
            }
            Some("status") => {
                let settings = store.get_with_defaults(phone).await;
                let status = if settings.anti_link {
                    "Enabled"
                } else {
                    "Disabled"
                };
                ctx.reply(format!("🔗 *Antilink Status:* {status}")).await
            }
            _ => {
                ctx.reply(format!(
                    "❌ Invalid usage. Please use:\n• {prefix}antilink on\n• {prefix}antilink off\n• {prefix}antilink status"
                ))
                .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        domain::Jid,
        messaging::types::{GroupMetadata, GroupParticipant, OutgoingMessage, ParticipantAction},
        plugins::testing::Fixture,
    };

    const GROUP: &str = "120363000000@g.us";

    fn participant(user: &str, admin: Option<&str>) -> GroupParticipant {
        GroupParticipant {
            id: Jid::new(format!("{user}@s.whatsapp.net")),
            admin: admin.map(str::to_string),
        }
    }

    fn fixture_with_group() -> Fixture {
        let fx = Fixture::new();
        fx.client.add_group(GroupMetadata {
            id: Jid::new(GROUP),
            subject: "Testers".to_string(),
            participants: vec![
                participant("13056978303", Some("superadmin")),
                participant("15550001", None),
                participant("15550002", None),
                participant("15550003", Some("admin")),
            ],
        });
        fx
    }

    #[tokio::test]
    async fn tagall_mentions_everyone_and_reacts() {
        let fx = fixture_with_group();
        fx.run(GROUP, "tagall", &["wake", "up"]).await.unwrap();

        let sent = fx.client.sent();
        assert_eq!(sent.len(), 2);
        let OutgoingMessage::Text { text, mentions, .. } = &sent[0].1 else {
            panic!("expected text");
        };
        assert_eq!(mentions.len(), 4);
        assert!(text.contains("📢 *Message:* wake up"));
        assert!(text.contains("4. @15550003"));
        assert!(matches!(&sent[1].1, OutgoingMessage::Reaction { emoji, .. } if emoji == "✅"));
    }

    #[tokio::test]
    async fn group_commands_refuse_private_chats() {
        let fx = Fixture::new();
        fx.run("15550009@s.whatsapp.net", "kickall", &[]).await.unwrap();
        assert_eq!(
            fx.client.sent_texts(),
            vec!["❌ This command can only be used in groups!".to_string()]
        );
        assert!(fx.client.recorded.lock().unwrap().participant_updates.is_empty());
    }

    #[tokio::test]
    async fn kickall_removes_non_admins_except_the_bot() {
        let fx = fixture_with_group();
        fx.run(GROUP, "kickall", &[]).await.unwrap();

        let updates = fx.client.recorded.lock().unwrap().participant_updates.clone();
        assert_eq!(updates.len(), 1);
        let (group, targets, action) = &updates[0];
        assert_eq!(group.as_str(), GROUP);
        assert_eq!(action, &ParticipantAction::Remove);
        // 15550001 is the bot's own number.
        assert_eq!(targets, &vec![Jid::new("15550002@s.whatsapp.net")]);
    }

    #[tokio::test]
    async fn antilink_toggles_setting() {
        let fx = fixture_with_group();
        let phone = fx.session.phone().clone();

        fx.run(GROUP, "antilink", &["ON"]).await.unwrap();
        assert!(fx.services.store.get_with_defaults(&phone).await.anti_link);

        fx.run(GROUP, "antilink", &["status"]).await.unwrap();
        fx.run(GROUP, "antilink", &["off"]).await.unwrap();
        assert!(!fx.services.store.get_with_defaults(&phone).await.anti_link);

        fx.run(GROUP, "antilink", &[]).await.unwrap();
        let texts = fx.client.sent_texts();
        assert_eq!(texts[1], "🔗 *Antilink Status:* Enabled");
        assert!(texts[3].starts_with("❌ Invalid usage."));
    }
}
