use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_contracts::{
    AgentRegistration, CallbackPayload, DeliveryRecord, DeliveryStatus, EventEnvelope,
    CALLBACK_TYPE,
};
use courier_kernel::hmac_sha256_hex;
use reqwest::Client;

use crate::audit::AuditDb;

/// Retried signed-callback dispatch. One spawned task per recipient; retries
/// for a recipient are sequential, recipients are independent.
pub struct DeliveryEngine {
    client: Client,
    max_retries: u32,
    base_delay_ms: u64,
    audit: Arc<AuditDb>,
}

struct DeliveryJob {
    delivery_id: String,
    event_id: String,
    session_key: String,
    agent_id: String,
    callback_url: String,
    body: Vec<u8>,
    signature: Option<String>,
}

impl DeliveryEngine {
    pub fn new(
        max_retries: u32,
        base_delay_ms: u64,
        timeout_ms: u64,
        audit: Arc<AuditDb>,
    ) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            max_retries,
            base_delay_ms,
            audit,
        })
    }

    /// Schedules delivery of `evt` to one recipient. The payload is built and
    /// serialized once; every retry re-sends the same bytes under the same
    /// deliveryId, so the signature is stable across attempts.
    pub fn dispatch(&self, evt: &EventEnvelope, recipient: &AgentRegistration) {
        let payload = CallbackPayload {
            payload_type: CALLBACK_TYPE.to_string(),
            delivery_id: uuid::Uuid::new_v4().to_string(),
            delivered_at: Utc::now().timestamp_millis(),
            event: evt.clone(),
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    event_id = %evt.event_id,
                    agent_id = %recipient.agent_id,
                    "failed to serialize callback payload: {err}"
                );
                return;
            }
        };
        let signature = match &recipient.callback_secret {
            Some(secret) => match hmac_sha256_hex(secret, &body) {
                Ok(hex) => Some(hex),
                Err(err) => {
                    tracing::warn!(
                        event_id = %evt.event_id,
                        agent_id = %recipient.agent_id,
                        "failed to sign callback payload: {err}"
                    );
                    return;
                }
            },
            None => None,
        };

        let job = DeliveryJob {
            delivery_id: payload.delivery_id,
            event_id: evt.event_id.clone(),
            session_key: evt.session_key.clone(),
            agent_id: recipient.agent_id.clone(),
            callback_url: recipient.callback_url.clone(),
            body,
            signature,
        };
        let client = self.client.clone();
        let audit = self.audit.clone();
        let max_retries = self.max_retries;
        let base_delay_ms = self.base_delay_ms;
        tokio::spawn(async move {
            run_delivery(client, audit, max_retries, base_delay_ms, job).await;
        });
    }
}

async fn run_delivery(
    client: Client,
    audit: Arc<AuditDb>,
    max_retries: u32,
    base_delay_ms: u64,
    job: DeliveryJob,
) {
    let mut attempt = 1u32;
    loop {
        match send_attempt(&client, &job, attempt).await {
            Ok(()) => {
                record(&audit, &job, DeliveryStatus::Success, attempt, None);
                return;
            }
            Err(err) => {
                if attempt >= max_retries {
                    tracing::warn!(
                        event_id = %job.event_id,
                        agent_id = %job.agent_id,
                        attempt,
                        "delivery abandoned: {err}"
                    );
                    record(&audit, &job, DeliveryStatus::Failed, attempt, Some(err));
                    return;
                }
                record(&audit, &job, DeliveryStatus::Retry, attempt, Some(err));
                tokio::time::sleep(Duration::from_millis(backoff_delay_ms(
                    base_delay_ms,
                    attempt,
                )))
                .await;
                attempt += 1;
            }
        }
    }
}

async fn send_attempt(client: &Client, job: &DeliveryJob, attempt: u32) -> Result<(), String> {
    let mut request = client
        .post(&job.callback_url)
        .header("content-type", "application/json")
        .header("x-router-agent-id", &job.agent_id)
        .header("x-router-event-id", &job.event_id)
        .header("x-router-attempt", attempt.to_string())
        .body(job.body.clone());
    if let Some(signature) = &job.signature {
        request = request
            .header("x-router-signature", signature)
            .header("x-router-signature-alg", "hmac-sha256");
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("callback returned status {}", response.status()))
    }
}

fn backoff_delay_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    base_delay_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
}

fn record(
    audit: &AuditDb,
    job: &DeliveryJob,
    status: DeliveryStatus,
    attempt: u32,
    error: Option<String>,
) {
    let result = audit.record_delivery(&DeliveryRecord {
        delivery_id: job.delivery_id.clone(),
        event_id: job.event_id.clone(),
        session_key: job.session_key.clone(),
        target_agent_id: job.agent_id.clone(),
        status,
        attempt,
        error,
    });
    if let Err(err) = result {
        tracing::warn!(delivery_id = %job.delivery_id, "failed to audit delivery: {err}");
    }
}
