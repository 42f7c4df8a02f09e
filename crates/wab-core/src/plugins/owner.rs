use async_trait::async_trait;
use chrono::Utc;

use super::{Plugin, PluginContext};
use crate::{domain::PhoneNumber, messaging::types::OutgoingMessage, Result};

pub struct OwnerPlugin;

#[async_trait]
impl Plugin for OwnerPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["owner"]
    }

    fn category(&self) -> &'static str {
        "Info"
    }

    fn description(&self) -> &'static str {
        "Display bot owner contact information"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        let cfg = &ctx.services.cfg;
        let number = cfg.owner_numbers.first().cloned().unwrap_or_default();
        let asker = ctx.params.push_name.as_deref().unwrap_or("there");

        ctx.reply(format!(
            "╭─────────────━┈⊷\n\
             │◦ 👑 *BOT OWNER INFO*\n\
             │◦ 🏷️ *Name:* {}\n\
             │◦ 📱 *Number:* +{number}\n\
             │◦ 🤖 *Bot:* {}\n\
             │◦ 👤 *Your Name:* {asker}\n\
             ╰─────────────━┈⊷\n\n\
             *Contact the owner for support, suggestions, or issues!*",
            cfg.owner_name, cfg.bot_name
        ))
        .await?;

        let Ok(phone) = PhoneNumber::parse(&number) else {
            return Ok(());
        };
        let vcard = ctx
            .services
            .distributor
            .vcf()
            .render_vcard(&cfg.owner_name, &phone, Utc::now());
        ctx.send(OutgoingMessage::Contact {
            display_name: cfg.owner_name.clone(),
            vcard,
        })
        .await
    }
}
