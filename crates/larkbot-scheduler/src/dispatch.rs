//! Message dispatch: delivers text to configured webhook targets.
//! Supports: Feishu/Lark custom bot (optionally signed) and generic JSON webhooks.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use larkbot_core::config::WebhookConfig;
use larkbot_core::error::{LarkBotError, Result};
use larkbot_core::traits::MessageSender;
use serde_json::{Value, json};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivery target.
#[derive(Debug, Clone)]
pub enum WebhookTarget {
    /// Feishu custom bot, `msg_type: text`, signed when a secret is set.
    Feishu { url: String, secret: Option<String> },
    /// Generic HTTP webhook: POST `{"text": ...}` with extra headers.
    Webhook { url: String, headers: BTreeMap<String, String> },
}

impl WebhookTarget {
    pub fn from_config(name: &str, config: &WebhookConfig) -> Result<Self> {
        match config.provider.as_str() {
            "feishu" | "lark" => Ok(WebhookTarget::Feishu {
                url: config.url.clone(),
                secret: config.secret.clone(),
            }),
            "webhook" => Ok(WebhookTarget::Webhook {
                url: config.url.clone(),
                headers: config.headers.clone(),
            }),
            other => Err(LarkBotError::Config(format!("webhook '{name}': unknown provider '{other}'"))),
        }
    }
}

/// Feishu bot signature: base64(HMAC-SHA256(key = "{timestamp}\n{secret}", message = "")).
pub fn feishu_sign(timestamp: i64, secret: &str) -> Result<String> {
    let key = format!("{timestamp}\n{secret}");
    let mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| LarkBotError::Channel(format!("cannot sign message: {e}")))?;
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Request body for a Feishu text message.
pub fn feishu_payload(text: &str, secret: Option<&str>, timestamp: i64) -> Result<Value> {
    let mut body = json!({
        "msg_type": "text",
        "content": {"text": text},
    });
    if let Some(secret) = secret {
        body["timestamp"] = Value::String(timestamp.to_string());
        body["sign"] = Value::String(feishu_sign(timestamp, secret)?);
    }
    Ok(body)
}

/// [`MessageSender`] over named webhook targets.
#[derive(Debug, Clone, Default)]
pub struct WebhookSender {
    client: reqwest::Client,
    targets: BTreeMap<String, WebhookTarget>,
}

impl WebhookSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(webhooks: &HashMap<String, WebhookConfig>) -> Result<Self> {
        let mut sender = Self::new();
        for (name, config) in webhooks {
            sender.add_target(name, WebhookTarget::from_config(name, config)?);
        }
        Ok(sender)
    }

    pub fn add_target(&mut self, name: &str, target: WebhookTarget) {
        self.targets.insert(name.to_string(), target);
    }

    pub fn target_names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    async fn post(&self, target: &str, url: &str, body: &Value, headers: &BTreeMap<String, String>) -> Result<Value> {
        let mut req = self.client.post(url).json(body).timeout(SEND_TIMEOUT);
        for (key, value) in headers {
            req = req.header(key.as_str(), value.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| LarkBotError::Channel(format!("send to '{target}' failed: {e}")))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(LarkBotError::Channel(format!("'{target}' returned {status}: {text}")));
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl MessageSender for WebhookSender {
    async fn send_text(&self, text: &str, target: &str) -> Result<()> {
        let destination = self
            .targets
            .get(target)
            .ok_or_else(|| LarkBotError::Channel(format!("unknown target '{target}'")))?;

        match destination {
            WebhookTarget::Feishu { url, secret } => {
                let body = feishu_payload(text, secret.as_deref(), chrono::Utc::now().timestamp())?;
                let reply = self.post(target, url, &body, &BTreeMap::new()).await?;
                // Feishu answers 200 with a non-zero `code` on rejection.
                let code = reply
                    .get("code")
                    .or_else(|| reply.get("StatusCode"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0);
                if code != 0 {
                    let msg = reply
                        .get("msg")
                        .or_else(|| reply.get("StatusMessage"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown error");
                    return Err(LarkBotError::Channel(format!("Feishu rejected message to '{target}': {code} {msg}")));
                }
            }
            WebhookTarget::Webhook { url, headers } => {
                self.post(target, url, &json!({"text": text}), headers).await?;
            }
        }
        tracing::info!("✅ Message sent to '{target}'");
        Ok(())
    }

    fn has_target(&self, target: &str) -> bool {
        self.targets.contains_key(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[test]
    fn test_feishu_payload_signing() {
        let unsigned = feishu_payload("hi", None, 1_700_000_000).unwrap();
        assert_eq!(unsigned, json!({"msg_type": "text", "content": {"text": "hi"}}));

        let signed = feishu_payload("hi", Some("secret"), 1_700_000_000).unwrap();
        assert_eq!(signed["timestamp"], json!("1700000000"));
        let sign = signed["sign"].as_str().unwrap();
        assert_eq!(sign, feishu_sign(1_700_000_000, "secret").unwrap());
        assert_eq!(BASE64.decode(sign).unwrap().len(), 32);
        assert_ne!(sign, feishu_sign(1_700_000_001, "secret").unwrap());
    }

    #[tokio::test]
    async fn test_feishu_send_and_rejection() {
        let mut server = Server::new_async().await;
        let ok = server
            .mock("POST", "/ok")
            .match_body(Matcher::PartialJson(json!({"msg_type": "text", "content": {"text": "deploy done"}})))
            .with_status(200)
            .with_body(r#"{"code": 0, "msg": "success"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/bad")
            .with_status(200)
            .with_body(r#"{"code": 19021, "msg": "sign match fail"}"#)
            .create_async()
            .await;

        let mut sender = WebhookSender::new();
        sender.add_target("ops", WebhookTarget::Feishu { url: format!("{}/ok", server.url()), secret: None });
        sender.add_target(
            "signed",
            WebhookTarget::Feishu { url: format!("{}/bad", server.url()), secret: Some("s".into()) },
        );

        sender.send_text("deploy done", "ops").await.unwrap();
        ok.assert_async().await;

        let err = sender.send_text("x", "signed").await.unwrap_err();
        assert!(err.to_string().contains("sign match fail"));
        assert!(sender.send_text("x", "nowhere").await.is_err());
        assert!(!sender.has_target("nowhere"));
    }

    #[tokio::test]
    async fn test_generic_webhook_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_header("authorization", "Bearer t")
            .match_body(Matcher::Json(json!({"text": "hello"})))
            .with_status(204)
            .create_async()
            .await;

        let config = WebhookConfig {
            provider: "webhook".into(),
            url: format!("{}/hook", server.url()),
            secret: None,
            headers: BTreeMap::from([("Authorization".to_string(), "Bearer t".to_string())]),
        };
        let sender = WebhookSender::from_config(&HashMap::from([("team".to_string(), config)])).unwrap();
        assert_eq!(sender.target_names(), vec!["team"]);
        sender.send_text("hello", "team").await.unwrap();
        mock.assert_async().await;
    }

    #[test]
    fn test_unknown_provider() {
        let config = WebhookConfig {
            provider: "carrier-pigeon".into(),
            url: "http://x".into(),
            secret: None,
            headers: BTreeMap::new(),
        };
        assert!(WebhookTarget::from_config("x", &config).is_err());
    }
}
