use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{json, Value};

use wireboard_core::error::{Result, WireboardError};
use wireboard_core::traits::{NodeDescription, NodeHandler, NodeHandlerContext};
use wireboard_core::types::{InputValues, OutputValues};

/// Fills `{{name}}` placeholders in `template` from the other inputs.
pub struct PromptTemplateHandler;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([\w$-]+)\s*\}\}").expect("placeholder regex"))
}

/// Parameter names in template order, without duplicates.
pub fn parameters(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for cap in placeholder().captures_iter(template) {
        let name = cap[1].to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute every placeholder, failing on the first missing parameter.
pub fn substitute(template: &str, params: &InputValues) -> Result<String> {
    if let Some(missing) = parameters(template)
        .into_iter()
        .find(|name| !params.contains_key(name))
    {
        return Err(WireboardError::Handler(format!(
            "Input is missing parameter \"{}\"",
            missing
        )));
    }
    let filled = placeholder().replace_all(template, |cap: &regex::Captures| {
        params.get(&cap[1]).map(render).unwrap_or_default()
    });
    Ok(filled.into_owned())
}

impl NodeHandler for PromptTemplateHandler {
    fn invoke(
        &self,
        inputs: InputValues,
        _ctx: NodeHandlerContext,
    ) -> BoxFuture<'_, Result<OutputValues>> {
        Box::pin(async move {
            let template = inputs
                .get("template")
                .and_then(Value::as_str)
                .ok_or_else(|| WireboardError::Handler("Template is required".into()))?;
            let prompt = substitute(template, &inputs)?;
            let mut out = OutputValues::new();
            out.insert("prompt".into(), Value::String(prompt));
            Ok(out)
        })
    }

    fn describe(&self, inputs: Option<&InputValues>) -> BoxFuture<'_, Result<NodeDescription>> {
        let params = inputs
            .and_then(|i| i.get("template"))
            .and_then(Value::as_str)
            .map(parameters)
            .unwrap_or_default();
        Box::pin(async move {
            let mut properties = serde_json::Map::new();
            properties.insert(
                "template".into(),
                json!({ "type": "string", "title": "Template", "format": "multiline" }),
            );
            for name in &params {
                properties.insert(name.clone(), json!({ "type": "string", "title": name }));
            }
            let mut required = vec![Value::String("template".into())];
            required.extend(params.into_iter().map(Value::String));
            Ok(NodeDescription {
                input_schema: json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": { "prompt": { "type": "string", "title": "Prompt" } },
                    "required": ["prompt"],
                }),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireboard_core::types::NodeDescriptor;
    use wireboard_test_utils::values;

    fn ctx() -> NodeHandlerContext {
        NodeHandlerContext::new(NodeDescriptor::new("t", "promptTemplate"))
    }

    #[test]
    fn parameters_are_unique_and_ordered() {
        assert_eq!(
            parameters("{{b}} then {{ a }} then {{b}}"),
            vec!["b".to_string(), "a".to_string()]
        );
    }

    #[tokio::test]
    async fn fills_placeholders() {
        let inputs = values(json!({
            "template": "Hello {{name}}, you have {{count}} messages",
            "name": "Ada",
            "count": 3
        }));
        let out = PromptTemplateHandler.invoke(inputs, ctx()).await.unwrap();
        assert_eq!(out["prompt"], "Hello Ada, you have 3 messages");
    }

    #[tokio::test]
    async fn missing_parameter_fails() {
        let inputs = values(json!({ "template": "Hi {{who}}" }));
        let err = PromptTemplateHandler.invoke(inputs, ctx()).await.unwrap_err();
        assert!(err.to_string().contains("\"who\""));
    }

    #[tokio::test]
    async fn describe_lists_parameters() {
        let inputs = values(json!({ "template": "{{topic}} in {{style}}" }));
        let desc = PromptTemplateHandler.describe(Some(&inputs)).await.unwrap();
        let props = desc.input_schema["properties"].as_object().unwrap();
        assert!(props.contains_key("topic"));
        assert!(props.contains_key("style"));
        assert_eq!(desc.input_schema["required"], json!(["template", "topic", "style"]));
    }
}
