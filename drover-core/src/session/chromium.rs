use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumBrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::page::Page;
use futures::StreamExt;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::BrowserConfig;
use crate::orchestrator::ReadyCondition;

use super::engine::{EngineError, EngineLauncher, EngineResult, SessionEngine};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Launches one Chromium instance per session, configured from
/// `browser.toml`.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    config: Arc<BrowserConfig>,
}

impl ChromiumLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn select_user_agent(&self) -> Option<String> {
        let mut rng = rand::thread_rng();
        self.config.user_agents.pool.choose(&mut rng).cloned()
    }

    fn build_chromium_config(&self, user_agent: Option<&str>) -> EngineResult<ChromiumBrowserConfig> {
        let chromium = &self.config.chromium;
        let viewport = &self.config.viewport;
        let flags = &self.config.flags;

        let mut builder = ChromiumBrowserConfig::builder().viewport(Viewport {
            width: viewport.width,
            height: viewport.height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: viewport.width >= viewport.height,
            has_touch: false,
        });

        if let Some(path) = &chromium.executable_path {
            builder = builder.chrome_executable(path);
        }
        if !chromium.headless {
            builder = builder.with_head();
        }
        if !chromium.sandbox {
            builder = builder.no_sandbox();
        }
        if let Some(seconds) = chromium.request_timeout_seconds {
            builder = builder.request_timeout(Duration::from_secs(seconds));
        }

        let mut args = vec![format!(
            "--window-size={},{}",
            viewport.width, viewport.height
        )];
        if let Some(user_agent) = user_agent {
            args.push(format!("--user-agent={user_agent}"));
        }
        if chromium.disable_gpu {
            args.push("--disable-gpu".into());
        }
        if flags.mute_audio {
            args.push("--mute-audio".into());
        }
        if flags.no_first_run {
            args.push("--no-first-run".into());
        }
        if flags.disable_automation_controlled {
            args.push("--disable-blink-features=AutomationControlled".into());
        }
        if let Some(lang) = &flags.lang {
            args.push(format!("--lang={lang}"));
        }
        args.extend(flags.extra_args.iter().cloned());
        builder = builder.args(args);

        builder.build().map_err(EngineError::Launch)
    }
}

#[async_trait]
impl EngineLauncher for ChromiumLauncher {
    async fn launch(&self) -> EngineResult<Box<dyn SessionEngine>> {
        let user_agent = self.select_user_agent();
        let chromium_config = self.build_chromium_config(user_agent.as_deref())?;

        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| EngineError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let page = browser
            .new_page(CreateTargetParams::new("about:blank"))
            .await
            .map_err(|err| EngineError::Launch(err.to_string()))?;

        if let Some(user_agent) = &user_agent {
            let params = SetUserAgentOverrideParams::builder()
                .user_agent(user_agent.clone())
                .build()
                .map_err(EngineError::Launch)?;
            page.set_user_agent(params)
                .await
                .map_err(|err| EngineError::Launch(err.to_string()))?;
        }

        info!(headless = self.config.chromium.headless, "chromium session launched");
        Ok(Box::new(ChromiumSession {
            browser,
            page,
            handler_task: Some(handler_task),
            default_script: self.config.extraction.default_script.clone(),
            pending_extract: None,
        }))
    }
}

/// One live Chromium instance plus the page it drives.
pub struct ChromiumSession {
    browser: Browser,
    page: Page,
    handler_task: Option<JoinHandle<()>>,
    default_script: String,
    pending_extract: Option<Value>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum InteractionStep {
    Click { selector: String },
    Type { selector: String, text: String },
    WaitMs { ms: u64 },
    Eval { script: String },
}

fn parse_steps(payload: &Value) -> EngineResult<Vec<InteractionStep>> {
    match payload.get("steps") {
        Some(steps) => serde_json::from_value(steps.clone())
            .map_err(|err| EngineError::InvalidTarget(format!("interaction payload: {err}"))),
        None => Ok(Vec::new()),
    }
}

fn selector_script(selector: &str) -> String {
    let quoted = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(() => {{ const el = document.querySelector({quoted}); return el ? el.textContent : null; }})()"
    )
}

/// Maps a CDP-level failure onto the engine taxonomy: timeouts and lost
/// connections are recognized by message, anything else keeps the
/// stage's default classification.
fn classify_cdp(message: String, fallback: fn(String) -> EngineError) -> EngineError {
    let lower = message.to_lowercase();
    if lower.contains("timeout") {
        EngineError::Timeout(message)
    } else if lower.contains("websocket")
        || lower.contains("connection")
        || lower.contains("channel closed")
    {
        EngineError::Crashed(message)
    } else {
        fallback(message)
    }
}

impl ChromiumSession {
    async fn evaluate_value(&self, script: &str) -> EngineResult<Value> {
        let evaluation = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| classify_cdp(err.to_string(), EngineError::Extraction))?;
        evaluation
            .into_value()
            .map_err(|err| EngineError::Extraction(err.to_string()))
    }

    async fn apply_step(&self, step: &InteractionStep) -> EngineResult<()> {
        match step {
            InteractionStep::Click { selector } => {
                let element = self
                    .page
                    .find_element(selector.as_str())
                    .await
                    .map_err(|_| EngineError::InteractionTargetNotFound(selector.clone()))?;
                element
                    .click()
                    .await
                    .map_err(|err| classify_cdp(err.to_string(), EngineError::Interaction))?;
            }
            InteractionStep::Type { selector, text } => {
                let element = self
                    .page
                    .find_element(selector.as_str())
                    .await
                    .map_err(|_| EngineError::InteractionTargetNotFound(selector.clone()))?;
                element
                    .click()
                    .await
                    .map_err(|err| classify_cdp(err.to_string(), EngineError::Interaction))?;
                element
                    .type_str(text)
                    .await
                    .map_err(|err| classify_cdp(err.to_string(), EngineError::Interaction))?;
            }
            InteractionStep::WaitMs { ms } => {
                sleep(Duration::from_millis(*ms)).await;
            }
            InteractionStep::Eval { script } => {
                self.page
                    .evaluate(script.as_str())
                    .await
                    .map_err(|err| classify_cdp(err.to_string(), EngineError::Interaction))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SessionEngine for ChromiumSession {
    async fn navigate(&mut self, target: &str) -> EngineResult<()> {
        let url = Url::parse(target)
            .map_err(|err| EngineError::InvalidTarget(format!("{target}: {err}")))?;
        let params = NavigateParams::builder()
            .url(url.as_str())
            .build()
            .map_err(EngineError::Navigation)?;
        self.page
            .goto(params)
            .await
            .map_err(|err| classify_cdp(err.to_string(), EngineError::Navigation))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|err| classify_cdp(err.to_string(), EngineError::Navigation))?;
        Ok(())
    }

    async fn wait_for_ready(
        &mut self,
        condition: &ReadyCondition,
        timeout: Duration,
    ) -> EngineResult<()> {
        match condition {
            // Navigation already settled in navigate().
            ReadyCondition::Load => Ok(()),
            ReadyCondition::Selector(selector) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if self.page.find_element(selector.as_str()).await.is_ok() {
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        return Err(EngineError::Ready(format!(
                            "selector {selector:?} did not resolve"
                        )));
                    }
                    sleep(SELECTOR_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn apply_interactions(&mut self, payload: &Value) -> EngineResult<()> {
        self.pending_extract = payload.get("extract").cloned();
        if payload.is_null() {
            return Ok(());
        }
        for step in parse_steps(payload)? {
            self.apply_step(&step).await?;
        }
        Ok(())
    }

    async fn extract(&mut self) -> EngineResult<Value> {
        let directive = self.pending_extract.take();
        let script = match &directive {
            Some(Value::String(script)) => script.clone(),
            Some(Value::Object(map)) => {
                if let Some(script) = map.get("script").and_then(Value::as_str) {
                    script.to_string()
                } else if let Some(selector) = map.get("selector").and_then(Value::as_str) {
                    selector_script(selector)
                } else {
                    return Err(EngineError::Extraction(
                        "extract directive needs a script or selector".to_string(),
                    ));
                }
            }
            Some(other) => {
                return Err(EngineError::Extraction(format!(
                    "unsupported extract directive: {other}"
                )));
            }
            None => self.default_script.clone(),
        };
        self.evaluate_value(&script).await
    }

    async fn close(&mut self) -> EngineResult<()> {
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close chromium gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "chromium handler join error");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_interaction_steps() {
        let payload = json!({
            "steps": [
                {"op": "click", "selector": "#accept"},
                {"op": "type", "selector": "input[name=q]", "text": "hello"},
                {"op": "wait_ms", "ms": 250},
                {"op": "eval", "script": "window.scrollTo(0, 1000)"}
            ]
        });
        let steps = parse_steps(&payload).unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(
            steps[0],
            InteractionStep::Click {
                selector: "#accept".into()
            }
        );
        assert_eq!(steps[2], InteractionStep::WaitMs { ms: 250 });
    }

    #[test]
    fn missing_steps_key_means_no_interactions() {
        let steps = parse_steps(&json!({"extract": {"selector": "h1"}})).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn unknown_step_op_is_rejected_as_invalid() {
        let payload = json!({"steps": [{"op": "dance"}]});
        let err = parse_steps(&payload).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTarget(_)));
    }

    #[test]
    fn selector_script_quotes_the_selector() {
        let script = selector_script("a[href=\"x\"]");
        assert!(script.contains("querySelector(\"a[href=\\\"x\\\"]\")"));
        assert!(script.contains("textContent"));
    }

    #[test]
    fn cdp_timeouts_and_disconnects_reclassify() {
        assert!(matches!(
            classify_cdp("request timeout".into(), EngineError::Navigation),
            EngineError::Timeout(_)
        ));
        assert!(matches!(
            classify_cdp("websocket closed".into(), EngineError::Interaction),
            EngineError::Crashed(_)
        ));
        assert!(matches!(
            classify_cdp("net::ERR_ABORTED".into(), EngineError::Navigation),
            EngineError::Navigation(_)
        ));
    }
}
