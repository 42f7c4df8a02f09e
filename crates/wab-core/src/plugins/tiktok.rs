use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{Plugin, PluginContext};
use crate::{errors::Error, messaging::types::OutgoingMessage, Result};

const CAPTION: &str = "> © Downloaded with TikTok downloader";
const PHOTO_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Default, Deserialize)]
struct TiktokResponse {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    data: Option<TiktokMedia>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TiktokMedia {
    video: Option<String>,
    #[serde(rename = "videoWM")]
    video_wm: Option<String>,
    #[serde(default)]
    photo: Vec<String>,
    audio: Option<String>,
}

/// Messages to send for `command`, in order.
fn plan_media(command: &str, media: &TiktokMedia) -> Vec<OutgoingMessage> {
    let wants_video = matches!(command, "tiktok" | "tt" | "tikwm");
    if wants_video {
        let url = if command == "tikwm" {
            media.video_wm.as_ref().or(media.video.as_ref())
        } else {
            media.video.as_ref()
        };
        if let Some(url) = url {
            return vec![OutgoingMessage::Video {
                url: url.clone(),
                caption: Some(CAPTION.to_string()),
            }];
        }
    }

    let mut out: Vec<OutgoingMessage> = media
        .photo
        .iter()
        .map(|url| OutgoingMessage::Image {
            url: url.clone(),
            caption: Some(CAPTION.to_string()),
        })
        .collect();

    if command == "tikmp3" {
        if let Some(url) = &media.audio {
            out.push(OutgoingMessage::Audio {
                url: url.clone(),
                mimetype: "audio/mp3".to_string(),
            });
        }
    }
    out
}

pub struct TiktokPlugin;

impl TiktokPlugin {
    async fn fetch(ctx: &PluginContext<'_>, url: &str) -> Result<TiktokResponse> {
        let cfg = &ctx.services.cfg;
        let mut query = vec![("url", url)];
        if let Some(key) = cfg.tiktok_api_key.as_deref() {
            query.push(("apikey", key));
        }
        let resp = ctx
            .services
            .http
            .get(&cfg.tiktok_api_url)
            .query(&query)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::External(format!(
                "tiktok api returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Plugin for TiktokPlugin {
    fn commands(&self) -> &'static [&'static str] {
        &["tiktok", "tt", "tikwm", "tikmp3"]
    }

    fn category(&self) -> &'static str {
        "Downloader"
    }

    fn description(&self) -> &'static str {
        "Download media from TikTok"
    }

    async fn execute(&self, ctx: &PluginContext<'_>) -> Result<()> {
        let command = ctx.params.command.as_str();
        let Some(url) = ctx.params.args.first() else {
            ctx.reply(format!(
                "❌ Please provide a TikTok URL (e.g., {}{command} https://www.tiktok.com/@user/video/12345)",
                ctx.params.prefix
            ))
            .await?;
            return Ok(());
        };
        if !url.contains("tiktok.com") {
            ctx.reply("❌ Invalid TikTok link.").await?;
            return Ok(());
        }

        let resp = match Self::fetch(ctx, url).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[TIKTOK] Fetch failed for {url}: {e}");
                ctx.reply("❌ Error occurred while fetching TikTok media.")
                    .await?;
                return Ok(());
            }
        };
        let media = match resp.data {
            Some(media) if resp.status => media,
            _ => {
                ctx.reply("❌ The downloader API returned an error.").await?;
                return Ok(());
            }
        };

        let plan = plan_media(command, &media);
        if plan.is_empty() {
            ctx.reply("❌ No media found or unsupported content.").await?;
            return Ok(());
        }

        let photos = plan
            .iter()
            .filter(|m| matches!(m, OutgoingMessage::Image { .. }))
            .count();
        for (idx, message) in plan.into_iter().enumerate() {
            if idx > 0 && photos > 1 {
                tokio::time::sleep(PHOTO_DELAY).await;
            }
            ctx.send(message).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::Fixture;

    fn media() -> TiktokMedia {
        serde_json::from_value(serde_json::json!({
            "video": "https://cdn.test/v.mp4",
            "videoWM": "https://cdn.test/wm.mp4",
            "photo": [],
            "audio": "https://cdn.test/a.mp3"
        }))
        .unwrap()
    }

    #[test]
    fn watermark_variant_prefers_wm_url() {
        let plan = plan_media("tikwm", &media());
        assert!(
            matches!(&plan[..], [OutgoingMessage::Video { url, .. }] if url == "https://cdn.test/wm.mp4")
        );
        let plan = plan_media("tt", &media());
        assert!(
            matches!(&plan[..], [OutgoingMessage::Video { url, .. }] if url == "https://cdn.test/v.mp4")
        );
    }

    #[test]
    fn mp3_sends_audio_and_albums_send_photos() {
        let plan = plan_media("tikmp3", &media());
        assert!(matches!(&plan[..], [OutgoingMessage::Audio { mimetype, .. }] if mimetype == "audio/mp3"));

        let album = TiktokMedia {
            photo: vec!["https://cdn.test/1.jpg".into(), "https://cdn.test/2.jpg".into()],
            ..Default::default()
        };
        assert_eq!(plan_media("tiktok", &album).len(), 2);
        assert!(plan_media("tikmp3", &TiktokMedia::default()).is_empty());
    }

    #[tokio::test]
    async fn rejects_missing_or_foreign_urls() {
        let fx = Fixture::new();
        fx.run("15550009@s.whatsapp.net", "tt", &[]).await.unwrap();
        fx.run("15550009@s.whatsapp.net", "tt", &["https://example.test/v"])
            .await
            .unwrap();
        let texts = fx.client.sent_texts();
        assert!(texts[0].starts_with("❌ Please provide a TikTok URL (e.g., .tt "));
        assert_eq!(texts[1], "❌ Invalid TikTok link.");
    }
}
