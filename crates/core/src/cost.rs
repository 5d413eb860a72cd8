//! Cost engine (spec §4.4): turns a completed trace's usage into USD,
//! honouring tiered text rates, the cached-token discount, and per-unit
//! image/audio pricing.

use std::collections::BTreeMap;

use crate::{
    domain::{AgentCompletion, LlmUsage, Pricing},
    error::{GatewayError, Result},
};

/// Price one call's usage against its model's pricing table.
///
/// A provider error that wouldn't normally be billed zeroes the cost
/// outright (spec §4.4: "If `provider_request_incurs_cost == false` ...
/// cost is 0"); the runner decides that flag from
/// [`GatewayError::provider_request_incurs_cost`].
pub fn compute_cost(usage: &LlmUsage, pricing: &Pricing, provider_request_incurs_cost: bool) -> Result<f64> {
    if !provider_request_incurs_cost {
        return Ok(0.0);
    }

    let mut total = 0.0;

    let prompt_rate = pricing.prompt_text_per_token.rate_for(usage.prompt_tokens_total);
    let cached = usage.prompt_tokens_cached.min(usage.prompt_tokens_text);
    let non_cached = usage.prompt_tokens_text.saturating_sub(cached);
    total += non_cached as f64 * prompt_rate;
    total += cached as f64 * (1.0 - pricing.cached_token_discount) * prompt_rate;
    total += usage.completion_tokens_total as f64 * pricing.completion_text_per_token.rate_for(usage.prompt_tokens_total);

    if usage.prompt_image_count > 0 {
        let per_image = pricing
            .per_image
            .as_ref()
            .ok_or_else(|| GatewayError::UnpriceableRun("model has no input image pricing".into()))?;
        total += usage.prompt_image_count as f64 * per_image.rate_for(usage.prompt_tokens_total);
    }

    if usage.prompt_tokens_audio > 0 {
        match (pricing.prompt_audio_per_token, pricing.prompt_audio_per_second) {
            (Some(per_token), _) => total += usage.prompt_tokens_audio as f64 * per_token,
            (None, Some(per_second)) => {
                let duration = usage
                    .prompt_audio_duration_seconds
                    .ok_or_else(|| GatewayError::UnpriceableRun("audio duration missing for per-second pricing".into()))?;
                total += duration * per_second;
            }
            (None, None) => return Err(GatewayError::UnpriceableRun("model has no audio pricing".into())),
        }
    }

    if usage.completion_image_count > 0 {
        let per_image = pricing
            .completion_per_image
            .as_ref()
            .ok_or_else(|| GatewayError::UnpriceableRun("model has no output image pricing".into()))?;
        total += usage.completion_image_count as f64 * per_image.rate_for(usage.prompt_tokens_total);
    }

    Ok(total)
}

/// Sum every trace's cost onto the completion (spec §4.3 step 5, §8
/// property 8). Idempotent: once `completion.cost_usd` is set this is a
/// no-op, so a failing second call (e.g. past the post-hoc timeout) can
/// never blank out an already-recorded success.
pub fn finalize_completion(completion: &mut AgentCompletion, pricing_by_model: &BTreeMap<String, Pricing>) {
    if completion.cost_usd.is_some() {
        return;
    }

    let mut total = 0.0;

    for trace in &mut completion.traces {
        let Some(usage) = trace.usage.as_mut() else { continue };
        let Some(pricing) = pricing_by_model.get(&trace.model) else {
            log::warn!("no pricing table for model '{}', leaving its usage unpriced", trace.model);
            continue;
        };

        match compute_cost(usage, pricing, trace.provider_request_incurs_cost) {
            Ok(cost) => {
                usage.cost_usd = Some(cost);
                total += cost;
            }
            Err(err) => {
                log::warn!("run is unpriceable for model '{}': {err}", trace.model);
                return;
            }
        }
    }

    completion.cost_usd = Some(total);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TieredRate;

    fn flat_pricing() -> Pricing {
        Pricing {
            prompt_text_per_token: TieredRate::flat(0.000_001),
            completion_text_per_token: TieredRate::flat(0.000_002),
            cached_token_discount: 0.5,
            per_image: None,
            completion_per_image: None,
            prompt_audio_per_token: None,
            prompt_audio_per_second: None,
        }
    }

    #[test]
    fn provider_fault_errors_are_free() {
        let usage = LlmUsage { prompt_tokens_total: 100, prompt_tokens_text: 100, ..Default::default() };
        assert_eq!(compute_cost(&usage, &flat_pricing(), false).unwrap(), 0.0);
    }

    #[test]
    fn cached_tokens_get_the_configured_discount() {
        let usage = LlmUsage {
            prompt_tokens_total: 100,
            prompt_tokens_text: 100,
            prompt_tokens_cached: 40,
            ..Default::default()
        };
        let cost = compute_cost(&usage, &flat_pricing(), true).unwrap();
        // 60 non-cached at full rate + 40 cached at half rate.
        let expected = 60.0 * 0.000_001 + 40.0 * 0.5 * 0.000_001;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn tiered_prompt_rate_applies_over_threshold() {
        let mut pricing = flat_pricing();
        pricing.prompt_text_per_token = TieredRate { base_rate: 0.000_001, threshold_tokens: Some(1000), over_threshold_rate: Some(0.000_002) };

        let usage = LlmUsage { prompt_tokens_total: 2000, prompt_tokens_text: 2000, ..Default::default() };
        let cost = compute_cost(&usage, &pricing, true).unwrap();
        assert!((cost - 2000.0 * 0.000_002).abs() < 1e-12);
    }

    #[test]
    fn missing_per_second_audio_duration_is_unpriceable() {
        let mut pricing = flat_pricing();
        pricing.prompt_audio_per_second = Some(0.0001);

        let usage = LlmUsage { prompt_tokens_audio: 1, ..Default::default() };
        assert!(matches!(compute_cost(&usage, &pricing, true), Err(GatewayError::UnpriceableRun(_))));
    }

    #[test]
    fn finalize_completion_is_idempotent_on_repeat_calls() {
        use crate::domain::{CompletionOutput, LlmCompletionTrace, Version};
        use gateway_config::ProviderId;

        let mut pricing = BTreeMap::new();
        pricing.insert("m".to_string(), flat_pricing());

        let mut completion = AgentCompletion {
            id: AgentCompletion::new_id(),
            agent_id: "agent".into(),
            version: Version {
                id: String::new(),
                model: "m".into(),
                provider: None,
                temperature: None,
                top_p: None,
                max_output_tokens: None,
                presence_penalty: None,
                frequency_penalty: None,
                parallel_tool_calls: None,
                enabled_tools: vec![],
                tool_choice: None,
                prompt: vec![],
                input_variables_schema: None,
                output_schema: None,
                structured_generation: false,
                use_structured_generation: false,
                reasoning_effort: None,
                reasoning_budget: None,
                use_fallback: Default::default(),
            },
            input_id: "input".into(),
            output: CompletionOutput::Success { messages: vec![] },
            duration_ms: 10,
            cost_usd: None,
            traces: vec![LlmCompletionTrace {
                messages_sent: vec![],
                model: "m".into(),
                provider: ProviderId::OpenAi,
                config_reference: "openai-default".into(),
                duration_ms: 10,
                usage: Some(LlmUsage { prompt_tokens_total: 10, prompt_tokens_text: 10, ..Default::default() }),
                error: None,
                provider_request_incurs_cost: true,
            }],
            conversation_id: None,
            metadata: serde_json::Value::Null,
        };

        finalize_completion(&mut completion, &pricing);
        let first = completion.cost_usd;
        assert!(first.is_some());

        // Simulate a later call finding no pricing at all: must not blank
        // out the value already recorded.
        finalize_completion(&mut completion, &BTreeMap::new());
        assert_eq!(completion.cost_usd, first);
    }
}
