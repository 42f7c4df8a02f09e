use async_trait::async_trait;

use super::{require_owner, Plugin, PluginContext};
use crate::{formatting::format_bytes, Result};

const STATUS_LIST_LIMIT: usize = 10;

pub struct DistributeVcfPlugin;

#[async_trait]
impl Plugin for DistributeVcfPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["distributevcf", "sendvcf", "vcf"]
    }

    fn category(&self) -> &'static str {
        "Owner"
    }

    fn description(&self) -> &'static str {
        "Compile the contact network file and send it here"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        if !require_owner(ctx).await? {
            return Ok(());
        }
        ctx.reply("🔄 Starting manual VCF distribution...").await?;

        let connected = ctx.services.registry.open_count();
        if connected == 0 {
            ctx.reply("⚠️ No connected users found for VCF distribution.")
                .await?;
            return Ok(());
        }

        let distributor = &ctx.services.distributor;
        let Some(compiled) = distributor.compile_current().await? else {
            ctx.reply("⚠️ No contacts with a display name to compile yet.")
                .await?;
            return Ok(());
        };
        let document = distributor
            .vcf()
            .compiled_document(compiled.contact_count)
            .await?;
        ctx.send(document).await?;
        ctx.reply(format!(
            "✅ VCF distribution test completed!\n📊 Total contacts: {}\n👥 Connected users: {connected}",
            compiled.contact_count
        ))
        .await
    }
}

pub struct VcfStatusPlugin;

#[async_trait]
impl Plugin for VcfStatusPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["vcfstatus", "vcfinfo"]
    }

    fn category(&self) -> &'static str {
        "Owner"
    }

    fn description(&self) -> &'static str {
        "Show contact file and scheduler status"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        if !require_owner(ctx).await? {
            return Ok(());
        }
        let services = ctx.services;
        let users = services.store.list_all().await?;
        let with_names = users
            .iter()
            .filter(|u| u.display_name.as_deref().is_some_and(|n| !n.trim().is_empty()))
            .count();
        let connected = services.registry.open_phones();
        let info = services.distributor.vcf().compiled_info().await;
        let scheduler = services.scheduler.status().await;

        let mut text = String::from("*📇 VCF CONTACT MANAGEMENT STATUS*\n\n");
        text.push_str("*👥 User Statistics:*\n");
        text.push_str(&format!("◦ Total users: {}\n", users.len()));
        text.push_str(&format!("◦ Users with contact names: {with_names}\n"));
        text.push_str(&format!("◦ Connected now: {}\n\n", connected.len()));

        text.push_str("*📁 Compiled File:*\n");
        if info.exists {
            text.push_str(&format!(
                "◦ Contacts: {}\n◦ Size: {}\n",
                info.contact_count.unwrap_or(0),
                format_bytes(info.file_size.unwrap_or(0))
            ));
            if let Some(modified) = info.last_modified {
                text.push_str(&format!(
                    "◦ Updated: {}\n",
                    modified.format("%Y-%m-%d %H:%M UTC")
                ));
            }
        } else {
            text.push_str("◦ Not compiled yet\n");
        }

        text.push_str("\n*⏰ Scheduler:*\n");
        text.push_str(&format!(
            "◦ Status: {}\n◦ Timezone: {}\n",
            if scheduler.running { "running" } else { "stopped" },
            scheduler.timezone
        ));
        if scheduler.distribution_running {
            text.push_str("◦ Distribution in progress\n");
        }

        if !connected.is_empty() {
            text.push_str("\n*📱 Connected Users:*\n");
            for phone in connected.iter().take(STATUS_LIST_LIMIT) {
                text.push_str(&format!("◦ +{phone}\n"));
            }
            if connected.len() > STATUS_LIST_LIMIT {
                text.push_str(&format!(
                    "... and {} more\n",
                    connected.len() - STATUS_LIST_LIMIT
                ));
            }
        }

        ctx.reply(text.trim_end().to_string()).await
    }
}
