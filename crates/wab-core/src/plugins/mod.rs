//! Command plugins.
//!
//! Every plugin is registered once in [`PluginRegistry::builtin`]; command
//! names are matched lower-cased and without the prefix.

mod group;
mod menu;
mod owner;
mod tiktok;
mod vcf;

use std::{collections::BTreeMap, collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    domain::{Jid, PhoneNumber},
    messaging::{
        port::WhatsAppClient,
        types::{IncomingMessage, OutgoingMessage},
    },
    services::BotServices,
    session::SessionHandle,
    Result,
};

/// Parameters derived from the incoming message by the dispatcher.
#[derive(Clone, Debug)]
pub struct PluginParams {
    /// Phone number of the session that received the message.
    pub phone_number: PhoneNumber,
    pub chat: Jid,
    pub sender: Jid,
    pub from_me: bool,
    pub is_group: bool,
    pub push_name: Option<String>,
    pub prefix: String,
    pub command: String,
    pub args: Vec<String>,
    pub query: String,
    pub is_owner: bool,
}

pub struct PluginContext<'a> {
    pub client: Arc<dyn WhatsAppClient>,
    pub message: &'a IncomingMessage,
    pub params: PluginParams,
    pub services: &'a BotServices,
    pub session: &'a SessionHandle,
    pub plugins: &'a PluginRegistry,
}

impl PluginContext<'_> {
    /// Quote-reply in the originating chat.
    pub async fn reply(&self, text: impl Into<String> + Send) -> Result<()> {
        self.client
            .send(
                &self.params.chat,
                OutgoingMessage::reply(text, &self.message.key),
            )
            .await?;
        Ok(())
    }

    pub async fn send(&self, message: OutgoingMessage) -> Result<()> {
        self.client.send(&self.params.chat, message).await?;
        Ok(())
    }

    pub async fn react(&self, emoji: &str) -> Result<()> {
        self.send(OutgoingMessage::Reaction {
            key: self.message.key.clone(),
            emoji: emoji.to_string(),
        })
        .await
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Primary command first, then aliases.
    fn commands(&self) -> &'static [&'static str];

    fn category(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()>;
}

/// Static command table.
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    by_command: HashMap<&'static str, usize>,
}

impl PluginRegistry {
    /// Later registrations never shadow an earlier command name.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        let mut by_command = HashMap::new();
        for (idx, plugin) in plugins.iter().enumerate() {
            for cmd in plugin.commands() {
                if by_command.contains_key(cmd) {
                    tracing::warn!("[PLUGINS] Duplicate command {cmd:?} ignored");
                    continue;
                }
                by_command.insert(*cmd, idx);
            }
        }
        Self {
            plugins,
            by_command,
        }
    }

    pub fn builtin() -> Self {
        let registry = Self::new(vec![
            Arc::new(menu::MenuPlugin),
            Arc::new(menu::ListMenuPlugin),
            Arc::new(owner::OwnerPlugin),
            Arc::new(group::TagAllPlugin),
            Arc::new(group::KickAllPlugin),
            Arc::new(group::AntiLinkPlugin),
            Arc::new(tiktok::TiktokPlugin),
            Arc::new(vcf::DistributeVcfPlugin),
            Arc::new(vcf::VcfStatusPlugin),
        ]);
        tracing::info!("[PLUGINS] Loaded {} plugins", registry.len());
        registry
    }

    pub fn get(&self, command: &str) -> Option<Arc<dyn Plugin>> {
        self.by_command
            .get(command)
            .and_then(|idx| self.plugins.get(*idx))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugins grouped by category, categories sorted.
    pub fn by_category(&self) -> BTreeMap<&'static str, Vec<Arc<dyn Plugin>>> {
        let mut out: BTreeMap<&'static str, Vec<Arc<dyn Plugin>>> = BTreeMap::new();
        for plugin in &self.plugins {
            out.entry(plugin.category()).or_default().push(plugin.clone());
        }
        out
    }
}

/// Reject with a reply unless the sender is an owner; `true` when allowed.
async fn require_owner(ctx: &PluginContext<'_>) -> Result<bool> {
    if ctx.params.is_owner {
        return Ok(true);
    }
    ctx.reply("❌ This command is only available for bot owners.")
        .await?;
    Ok(false)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::Config,
        domain::MessageKey,
        messaging::types::MessageContent,
        scheduler::BackgroundScheduler,
        session::SessionRegistry,
        settings::{JsonFileBackend, SettingsStore},
        test_support::{test_config, FakeClient},
        vcf::{VcfDistributor, VcfManager},
    };

    pub struct Fixture {
        pub services: Arc<BotServices>,
        pub registry: Arc<PluginRegistry>,
        pub client: Arc<FakeClient>,
        pub session: SessionHandle,
        pub _dir: tempfile::TempDir,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cfg: Arc<Config> = Arc::new(test_config(dir.path()));
            let store = Arc::new(SettingsStore::new(
                None,
                JsonFileBackend::new(&cfg.fallback_store_path),
            ));
            let sessions = Arc::new(SessionRegistry::new());
            let vcf = Arc::new(VcfManager::from_config(&cfg));
            let distributor = Arc::new(VcfDistributor::new(
                vcf,
                store.clone(),
                sessions.clone(),
                Duration::ZERO,
            ));
            let scheduler =
                BackgroundScheduler::new(cfg.clone(), store.clone(), distributor.clone());
            let services =
                BotServices::new(cfg, store, sessions.clone(), distributor, scheduler).unwrap();
            let session = SessionHandle::detached(
                PhoneNumber::parse("15550001").unwrap(),
                dir.path().join("sessions/15550001"),
            );
            let client = Arc::new(FakeClient::new());
            session.set_client(client.clone());
            Self {
                services: Arc::new(services),
                registry: Arc::new(PluginRegistry::builtin()),
                client,
                session,
                _dir: dir,
            }
        }

        pub fn message(&self, chat: &str, text: &str) -> IncomingMessage {
            IncomingMessage {
                key: MessageKey {
                    remote_jid: Jid::new(chat),
                    id: "IN1".to_string(),
                    from_me: false,
                    participant: Jid::new(chat)
                        .is_group()
                        .then(|| Jid::new("13056978303@s.whatsapp.net")),
                },
                push_name: Some("Tester".to_string()),
                timestamp: None,
                content: MessageContent::Text {
                    text: text.to_string(),
                },
                quoted: None,
            }
        }

        pub fn params(&self, msg: &IncomingMessage, command: &str, args: &[&str]) -> PluginParams {
            PluginParams {
                phone_number: self.session.phone().clone(),
                chat: msg.chat().clone(),
                sender: msg.sender().clone(),
                from_me: false,
                is_group: msg.is_group(),
                push_name: msg.push_name.clone(),
                prefix: ".".to_string(),
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                query: args.join(" "),
                is_owner: true,
            }
        }

        pub fn ctx<'a>(&'a self, msg: &'a IncomingMessage, params: PluginParams) -> PluginContext<'a> {
            PluginContext {
                client: self.client.clone(),
                message: msg,
                params,
                services: &self.services,
                session: &self.session,
                plugins: &self.registry,
            }
        }

        pub async fn run(&self, chat: &str, command: &str, args: &[&str]) -> Result<()> {
            let msg = self.message(chat, &format!(".{command} {}", args.join(" ")));
            let params = self.params(&msg, command, args);
            let plugin = self.registry.get(command).unwrap();
            plugin.execute(&self.ctx(&msg, params)).await
        }
    }
}
