use async_trait::async_trait;
use chrono::{Datelike, Utc};

use super::{Plugin, PluginContext};
use crate::{
    formatting::{format_uptime, to_monospace},
    messaging::types::{Button, ListRow, ListSection, OutgoingMessage},
    Result,
};

fn header(ctx: &PluginContext<'_>) -> String {
    let cfg = &ctx.services.cfg;
    let owner = cfg
        .owner_numbers
        .first()
        .map(|n| format!("+{n}"))
        .unwrap_or_default();
    let mut out = String::from("╭─────────────━┈⊷\n");
    out.push_str(&format!("│◦ {} : *{}*\n", to_monospace("Bot name"), cfg.bot_name));
    out.push_str(&format!("│◦ {} : *{}*\n", to_monospace("Owner"), cfg.owner_name));
    out.push_str(&format!("│◦ {} : *{owner}*\n", to_monospace("Owner number")));
    out.push_str(&format!(
        "│◦ {} : *{}*\n",
        to_monospace("Runtime"),
        format_uptime(ctx.services.uptime())
    ));
    out.push_str(&format!(
        "│◦ {} : *{}*\n",
        to_monospace("Platform"),
        std::env::consts::OS
    ));
    out.push_str(&format!(
        "│◦ {} : *{}*\n",
        to_monospace("Total plugins"),
        ctx.plugins.len()
    ));
    out.push_str(&format!(
        "│◦ {} : *{}*\n",
        to_monospace("Users connected"),
        ctx.services.registry.open_count()
    ));
    out.push_str(&format!(
        "│◦ {} : *[{}]*\n",
        to_monospace("Prefix"),
        ctx.params.prefix
    ));
    out.push_str("╰─────────────━┈⊷\n\n");
    out
}

/// Header plus one block per category listing each plugin's primary command.
pub(super) fn menu_text(ctx: &PluginContext<'_>) -> String {
    let mut out = header(ctx);
    for (category, plugins) in ctx.plugins.by_category() {
        out.push_str(&format!("╭─ *{} COMMANDS* ━┈⊷\n", category.to_uppercase()));
        for plugin in plugins {
            if let Some(cmd) = plugin.commands().first() {
                out.push_str(&format!("│◦ {}\n", to_monospace(cmd)));
            }
        }
        out.push_str("╰─────────────━┈⊷\n\n");
    }
    out
}

fn footer(ctx: &PluginContext<'_>) -> String {
    format!("{} © {}", ctx.services.cfg.bot_name, Utc::now().year())
}

/// Image with caption when a menu image is configured, plain text otherwise.
async fn send_captioned(ctx: &PluginContext<'_>, caption: String) -> Result<()> {
    match &ctx.services.cfg.menu_image_url {
        Some(url) => {
            ctx.send(OutgoingMessage::Image {
                url: url.clone(),
                caption: Some(caption),
            })
            .await
        }
        None => ctx.reply(caption).await,
    }
}

pub struct MenuPlugin;

#[async_trait]
impl Plugin for MenuPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["menu", "help", "commands"]
    }

    fn category(&self) -> &'static str {
        "Main"
    }

    fn description(&self) -> &'static str {
        "Display bot menu with all available commands"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        let text = menu_text(ctx);
        if !ctx.client.capabilities().supports_buttons {
            return send_captioned(ctx, text).await;
        }

        let buttons = [
            ("listmenu", "📂 Menu Options"),
            ("owner", "👑 Owner"),
            ("vcfstatus", "📇 VCF Status"),
            ("antilink status", "🔗 Antilink Status"),
        ]
        .into_iter()
        .map(|(id, text)| Button {
            id: id.to_string(),
            text: text.to_string(),
        })
        .collect();

        ctx.send(OutgoingMessage::Buttons {
            text,
            footer: Some(footer(ctx)),
            buttons,
        })
        .await
    }
}

pub struct ListMenuPlugin;

impl ListMenuPlugin {
    fn sections(prefix: &str) -> Vec<ListSection> {
        let rows = [
            ("📂 All Menu", "Open all commands", "menu"),
            ("👑 Owner", "Contact bot owner", "owner"),
            ("📥 TikTok", "Download media from a TikTok URL", "tiktok"),
            ("👥 Tag All", "Mention every group member", "tagall"),
            ("🔗 Antilink", "Toggle antilink on/off", "antilink status"),
            ("📇 VCF Status", "Contact file statistics", "vcfstatus"),
        ];
        vec![ListSection {
            title: "📁 Commands".to_string(),
            rows: rows
                .into_iter()
                .map(|(title, description, cmd)| ListRow {
                    id: format!("{prefix}{cmd}"),
                    title: title.to_string(),
                    description: description.to_string(),
                })
                .collect(),
        }]
    }
}

#[async_trait]
impl Plugin for ListMenuPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["listmenu", "list", "imenu"]
    }

    fn category(&self) -> &'static str {
        "Main"
    }

    fn description(&self) -> &'static str {
        "Display interactive bot menu with selectable options"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        let mut caption = header(ctx);
        if !ctx.client.capabilities().supports_lists {
            caption.push_str("*Button menu not supported. Use regular commands.*");
            return send_captioned(ctx, caption).await;
        }

        caption.push_str("*Select a menu option below:*");
        ctx.send(OutgoingMessage::List {
            title: format!("{} - Menu", ctx.services.cfg.bot_name),
            text: caption,
            footer: Some(footer(ctx)),
            button_text: "📂 Menu Options".to_string(),
            sections: Self::sections(&ctx.params.prefix),
        })
        .await
    }
}
