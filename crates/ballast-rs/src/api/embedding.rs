//! Embedding requests and batched fan-out through the worker pool.

use crate::OpenAiClient;
use crate::api::classify::{CallSite, ProviderError, classify_error, classify_message};
use crate::api::model::EmbeddingModel;
use crate::api::pool::{WorkError, WorkItem, WorkerPool};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    data: Vec<EmbeddingData>,
    error: Option<crate::ApiErrorResponse>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

impl OpenAiClient {
    pub(crate) fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    /// Embed a batch of inputs. Vectors are returned in input order.
    pub async fn embeddings(
        &self,
        model: &str,
        input: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let url = self.embeddings_url();
        let site = CallSite::new(model, &url);
        debug!("Embedding request: model={model}, inputs={}", input.len());

        let resp = self
            .post(&url)
            .timeout(self.timeout)
            .json(&EmbeddingRequest { model, input })
            .send()
            .await
            .map_err(|e| crate::transport_error(&e, &site))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| crate::transport_error(&e, &site))?;

        if !status.is_success() {
            return Err(classify_message(
                &format!("API HTTP {status}: {text}"),
                Some(status.as_u16()),
                &site,
            ));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&text).map_err(|e| {
            classify_message(&format!("failed to parse embedding response: {e}"), None, &site)
        })?;
        if let Some(err) = parsed.error {
            return Err(classify_message(
                &format!("API error: {}", err.message),
                None,
                &site,
            ));
        }

        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        if data.len() != input.len() {
            return Err(classify_message(
                &format!(
                    "embedding response has {} vectors for {} inputs",
                    data.len(),
                    input.len()
                ),
                None,
                &site,
            ));
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Embed `inputs` in batches of `batch_size`, running batches through
/// `pool`. The result is in input order.
///
/// Every batch runs even if another fails; the first failing batch (in
/// input order) is returned as the error.
pub async fn embed_all<M>(
    model: Arc<M>,
    model_name: &str,
    inputs: Vec<String>,
    batch_size: usize,
    pool: &WorkerPool,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>, ProviderError>
where
    M: EmbeddingModel + ?Sized + 'static,
{
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    let batch_size = batch_size.max(1);
    let batches: Vec<Vec<String>> = inputs.chunks(batch_size).map(<[String]>::to_vec).collect();
    let batch_count = batches.len();

    let items: Vec<WorkItem<(usize, Vec<Vec<f32>>)>> = batches
        .into_iter()
        .enumerate()
        .map(|(index, batch)| {
            let model = Arc::clone(&model);
            let model_name = model_name.to_string();
            WorkItem::new(format!("batch-{index}"), move |_token| async move {
                let vectors = model.embed(&model_name, &batch).await?;
                Ok((index, vectors))
            })
        })
        .collect();

    let results = pool
        .process_with_progress(items, cancel, |done, total| {
            debug!("Embedding batches: {done}/{total}");
        })
        .await;

    let site = CallSite::new(model_name, model.endpoint());
    let mut ordered: Vec<Option<Vec<Vec<f32>>>> = vec![None; batch_count];
    let mut first_error: Option<(usize, ProviderError)> = None;
    for result in results {
        let index = batch_index(&result.id);
        match result.result {
            Ok((i, vectors)) => {
                if let Some(slot) = ordered.get_mut(i) {
                    *slot = Some(vectors);
                }
            }
            Err(e) => {
                let err = match e {
                    WorkError::Cancelled => ProviderError::cancelled(&site),
                    WorkError::Failed(inner) => classify_error(inner, &site),
                    WorkError::Panicked(msg) => {
                        classify_message(&format!("embedding batch panicked: {msg}"), None, &site)
                    }
                };
                if first_error.as_ref().is_none_or(|(i, _)| index < *i) {
                    first_error = Some((index, err));
                }
            }
        }
    }

    if let Some((_, err)) = first_error {
        return Err(err);
    }
    Ok(ordered.into_iter().flatten().flatten().collect())
}

fn batch_index(id: &str) -> usize {
    id.strip_prefix("batch-")
        .and_then(|n| n.parse().ok())
        .unwrap_or(usize::MAX)
}
