use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use streamgate_common::Headers;
use streamgate_protocol::chat::ChatCompletionRequest;
use tracing::{info, warn};

pub const HEADER_ORIGINAL_MODEL: &str = "x-original-model";
pub const HEADER_SELECT_LLM: &str = "x-select-llm";
pub const HEADER_USER_INPUT: &str = "x-user-input";

const MAX_HEADER_VALUE_BYTES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub selected: String,
    pub current_user_input: String,
    /// Ordered candidates, preferred first.
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("router unavailable: {0}")]
    Unavailable(String),
}

/// Picks candidate models for requests addressed to the `auto` model.
#[async_trait]
pub trait ModelRouter: Send + Sync {
    async fn route(
        &self,
        headers: &Headers,
        request: &ChatCompletionRequest,
    ) -> Result<RouteDecision, RouteError>;
}

/// Router with a fixed candidate order.
pub struct StaticRouter {
    candidates: Vec<String>,
}

impl StaticRouter {
    pub fn new(candidates: Vec<String>) -> Self {
        Self { candidates }
    }
}

#[async_trait]
impl ModelRouter for StaticRouter {
    async fn route(
        &self,
        _headers: &Headers,
        request: &ChatCompletionRequest,
    ) -> Result<RouteDecision, RouteError> {
        Ok(RouteDecision {
            selected: self.candidates.first().cloned().unwrap_or_default(),
            current_user_input: request.last_user_text().unwrap_or_default(),
            candidates: self.candidates.clone(),
        })
    }
}

/// Models to try for one request plus headers to send upstream with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPlan {
    pub models: Vec<String>,
    /// Whether the list came from the router.
    pub routed: bool,
    pub upstream_headers: Headers,
}

impl ModelPlan {
    pub fn single(model: &str) -> Self {
        Self {
            models: vec![model.to_string()],
            routed: false,
            upstream_headers: Vec::new(),
        }
    }
}

/// Resolves the candidate list. Only `auto` requests consult the router; a
/// router error or an empty answer falls back to the requested name.
pub async fn plan_models(
    router: Option<&dyn ModelRouter>,
    headers: &Headers,
    request: &ChatCompletionRequest,
) -> ModelPlan {
    let Some(router) = router.filter(|_| request.is_auto()) else {
        return ModelPlan::single(&request.model);
    };

    match router.route(headers, request).await {
        Ok(decision) if !decision.candidates.is_empty() => {
            info!(
                selected = %decision.selected,
                candidates = ?decision.candidates,
                "router selected models"
            );
            let upstream_headers = vec![
                (HEADER_ORIGINAL_MODEL.to_string(), "Auto".to_string()),
                (HEADER_SELECT_LLM.to_string(), decision.selected.clone()),
                (
                    HEADER_USER_INPUT.to_string(),
                    STANDARD.encode(sanitize_header_value(&decision.current_user_input)),
                ),
            ];
            ModelPlan {
                models: decision.candidates,
                routed: true,
                upstream_headers,
            }
        }
        Ok(_) => {
            warn!("router returned no candidates, using requested model");
            ModelPlan::single(&request.model)
        }
        Err(err) => {
            warn!(error = %err, "router failed, using requested model");
            ModelPlan::single(&request.model)
        }
    }
}

/// Strips control characters and caps the length so the value is safe to
/// place in a header.
pub fn sanitize_header_value(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.len() <= MAX_HEADER_VALUE_BYTES {
        return cleaned.to_string();
    }
    let mut end = MAX_HEADER_VALUE_BYTES;
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    cleaned[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingRouter;

    #[async_trait]
    impl ModelRouter for FailingRouter {
        async fn route(
            &self,
            _headers: &Headers,
            _request: &ChatCompletionRequest,
        ) -> Result<RouteDecision, RouteError> {
            Err(RouteError::Unavailable("down".to_string()))
        }
    }

    fn request(model: &str) -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "find\r\nthe bug"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn auto_requests_use_router_candidates() {
        let router = StaticRouter::new(vec!["m1".to_string(), "m2".to_string()]);
        let plan = plan_models(Some(&router), &Vec::new(), &request("auto")).await;
        assert!(plan.routed);
        assert_eq!(plan.models, vec!["m1", "m2"]);
        let input = plan
            .upstream_headers
            .iter()
            .find(|(name, _)| name == HEADER_USER_INPUT)
            .map(|(_, value)| STANDARD.decode(value).unwrap())
            .unwrap();
        assert_eq!(input, b"findthe bug");
    }

    #[tokio::test]
    async fn named_models_and_router_failures_stay_single() {
        let router = StaticRouter::new(vec!["m1".to_string()]);
        let plan = plan_models(Some(&router), &Vec::new(), &request("gpt")).await;
        assert_eq!(plan, ModelPlan::single("gpt"));

        let plan = plan_models(Some(&FailingRouter), &Vec::new(), &request("auto")).await;
        assert_eq!(plan, ModelPlan::single("auto"));

        let empty = StaticRouter::new(Vec::new());
        let plan = plan_models(Some(&empty), &Vec::new(), &request("auto")).await;
        assert!(!plan.routed);
    }

    #[test]
    fn sanitize_caps_on_char_boundary() {
        let long = "é".repeat(100);
        let out = sanitize_header_value(&long);
        assert!(out.len() <= 128);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
