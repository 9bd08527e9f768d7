//! OpenTimestamps Calendar Client
//!
//! Talks to an OpenTimestamps calendar server for submitting digests and
//! fetching upgraded, Bitcoin-attested timestamps. Artifacts are stored as
//! detached timestamp files, so each one names the digest it starts from.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::timestamp::{DetachedTimestamp, OtsAttestation, Timestamp};
use super::{Attestation, TimestampService, UpgradeOutcome};
use crate::error::{LedgerError, LedgerResult};

const OTS_ACCEPT: &str = "application/vnd.opentimestamps.v1";

fn http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("audit-ledger/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    merkle_root: String,
}

/// Esplora-style block explorer used to look up block Merkle roots
pub struct BlockExplorer {
    base_url: String,
    http_client: Client,
}

impl BlockExplorer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: http_client(timeout),
        }
    }

    /// Merkle root of the block at `height`, in the byte order a Bitcoin
    /// attestation commits to
    pub async fn merkle_root(&self, height: u64) -> LedgerResult<Vec<u8>> {
        let response = self
            .http_client
            .get(format!("{}/block-height/{}", self.base_url, height))
            .send()
            .await?
            .error_for_status()?;
        let block_hash = response.text().await?;

        let block: BlockInfo = self
            .http_client
            .get(format!("{}/block/{}", self.base_url, block_hash.trim()))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut root = hex::decode(&block.merkle_root).map_err(|e| {
            LedgerError::ServiceError(format!("Explorer returned a bad merkle root: {}", e))
        })?;
        if root.len() != 32 {
            return Err(LedgerError::ServiceError(format!(
                "Explorer returned a {} byte merkle root",
                root.len()
            )));
        }
        // explorers display hashes byte-reversed
        root.reverse();
        Ok(root)
    }
}

/// Client for a single calendar server
pub struct CalendarClient {
    calendar_url: String,
    http_client: Client,
    explorer: Option<BlockExplorer>,
}

impl CalendarClient {
    pub fn new(calendar_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            calendar_url: calendar_url.into().trim_end_matches('/').to_string(),
            http_client: http_client(timeout),
            explorer: None,
        }
    }

    /// Check Bitcoin attestations against block headers from `explorer`
    pub fn with_explorer(mut self, explorer: BlockExplorer) -> Self {
        self.explorer = Some(explorer);
        self
    }

    pub fn url(&self) -> &str {
        &self.calendar_url
    }

    /// Ask the calendar for a timestamp of one pending commitment
    async fn fetch_upgrade(&self, commitment: &[u8]) -> LedgerResult<Option<Timestamp>> {
        let response = self
            .http_client
            .get(format!("{}/timestamp/{}", self.calendar_url, hex::encode(commitment)))
            .header(reqwest::header::ACCEPT, OTS_ACCEPT)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("Calendar {} has no upgrade yet", self.calendar_url);
                Ok(None)
            }
            status if status.is_success() => {
                let bytes = response.bytes().await?;
                let upgrade = Timestamp::decode(commitment, &bytes).map_err(|e| {
                    LedgerError::ServiceError(format!("Calendar {} upgrade: {}", self.calendar_url, e))
                })?;
                Ok(Some(upgrade))
            }
            status => {
                warn!("Calendar {} upgrade answered {}", self.calendar_url, status);
                Err(LedgerError::ServiceError(format!(
                    "Calendar {} upgrade failed: {}",
                    self.calendar_url, status
                )))
            }
        }
    }

    fn open(&self, digest: &[u8; 32], artifact: &[u8]) -> Result<DetachedTimestamp, String> {
        let detached = DetachedTimestamp::decode(artifact).map_err(|e| e.to_string())?;
        if detached.digest != *digest {
            return Err(format!(
                "timestamp from {} starts at {}, not {}",
                self.calendar_url,
                hex::encode(detached.digest),
                hex::encode(digest)
            ));
        }
        Ok(detached)
    }
}

#[async_trait]
impl TimestampService for CalendarClient {
    fn name(&self) -> &str {
        &self.calendar_url
    }

    async fn submit(&self, digest: &[u8; 32]) -> LedgerResult<Vec<u8>> {
        info!("Submitting {} to calendar {}", hex::encode(digest), self.calendar_url);

        let response = self
            .http_client
            .post(format!("{}/digest", self.calendar_url))
            .header(reqwest::header::ACCEPT, OTS_ACCEPT)
            .body(digest.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LedgerError::ServiceError(format!(
                "Calendar {} rejected digest: {}",
                self.calendar_url,
                response.status()
            )));
        }

        let bytes = response.bytes().await?;
        let timestamp = Timestamp::decode(digest, &bytes).map_err(|e| {
            LedgerError::ServiceError(format!("Calendar {} returned {}", self.calendar_url, e))
        })?;
        debug!("Calendar {} returned {} bytes", self.calendar_url, bytes.len());
        Ok(DetachedTimestamp::new(*digest, timestamp)?.to_bytes())
    }

    async fn upgrade(&self, digest: &[u8; 32], artifact: &[u8]) -> LedgerResult<UpgradeOutcome> {
        let mut detached = self
            .open(digest, artifact)
            .map_err(LedgerError::ProofInvalid)?;
        if detached.timestamp.is_complete() {
            return Ok(UpgradeOutcome::Unchanged);
        }

        let mut pending: Vec<Vec<u8>> = Vec::new();
        for commitment in detached.timestamp.commitments() {
            if matches!(commitment.attestation, OtsAttestation::Pending { .. })
                && !pending.iter().any(|msg| msg == commitment.msg)
            {
                pending.push(commitment.msg.to_vec());
            }
        }

        let mut changed = false;
        for commitment in pending {
            if let Some(upgrade) = self.fetch_upgrade(&commitment).await? {
                changed |= detached.timestamp.merge(&upgrade);
            }
        }

        Ok(if changed {
            UpgradeOutcome::Upgraded(detached.to_bytes())
        } else {
            UpgradeOutcome::Unchanged
        })
    }

    async fn verify(&self, digest: &[u8; 32], artifact: &[u8]) -> LedgerResult<Attestation> {
        let detached = match self.open(digest, artifact) {
            Ok(detached) => detached,
            Err(reason) => return Ok(Attestation::Invalid(reason)),
        };

        let commitments = detached.timestamp.commitments();
        let mut bitcoin: Vec<(u64, &[u8])> = commitments
            .iter()
            .filter_map(|c| match c.attestation {
                OtsAttestation::Bitcoin { height } => Some((*height, c.msg)),
                _ => None,
            })
            .collect();
        bitcoin.sort_by_key(|(height, _)| *height);

        if bitcoin.is_empty() {
            let pending = commitments
                .iter()
                .any(|c| matches!(c.attestation, OtsAttestation::Pending { .. }));
            return Ok(if pending {
                Attestation::Pending
            } else {
                Attestation::Invalid(format!("no attestation in timestamp from {}", self.calendar_url))
            });
        }

        let Some(explorer) = &self.explorer else {
            let (block_height, _) = bitcoin[0];
            debug!(
                "No block explorer configured; trusting attestation at block {}",
                block_height
            );
            return Ok(Attestation::Confirmed { block_height });
        };

        let mut mismatched = Vec::new();
        for (height, msg) in bitcoin {
            if explorer.merkle_root(height).await? == msg {
                return Ok(Attestation::Confirmed { block_height: height });
            }
            mismatched.push(height.to_string());
        }
        Ok(Attestation::Invalid(format!(
            "timestamp does not match the merkle root of block {}",
            mismatched.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ots::timestamp::{Op, Step, BITCOIN_TAG};
    use sha2::{Digest, Sha256};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NONCE: [u8; 16] = [0xaa; 16];

    /// What a calendar answers to `POST /digest`
    fn pending_response(digest: &[u8]) -> Timestamp {
        let commitment = [digest, &NONCE[..]].concat();
        Timestamp {
            msg: digest.to_vec(),
            steps: vec![Step::Op(
                Op::Append(NONCE.to_vec()),
                Timestamp {
                    msg: commitment,
                    steps: vec![Step::Attest(OtsAttestation::Pending {
                        uri: "https://alice.btc.calendar.opentimestamps.org".to_string(),
                    })],
                },
            )],
        }
    }

    fn commitment_of(digest: &[u8]) -> Vec<u8> {
        [digest, &NONCE[..]].concat()
    }

    /// What a calendar answers to `GET /timestamp/<commitment>` once mined
    fn mined_response(commitment: &[u8], height: u64) -> Timestamp {
        let root = Sha256::digest(commitment).to_vec();
        Timestamp {
            msg: commitment.to_vec(),
            steps: vec![Step::Op(
                Op::Sha256,
                Timestamp {
                    msg: root,
                    steps: vec![Step::Attest(OtsAttestation::Bitcoin { height })],
                },
            )],
        }
    }

    fn confirmed_artifact(digest: [u8; 32], height: u64) -> Vec<u8> {
        let mut timestamp = pending_response(&digest);
        timestamp.merge(&mined_response(&commitment_of(&digest), height));
        DetachedTimestamp::new(digest, timestamp).unwrap().to_bytes()
    }

    async fn mount_block(server: &MockServer, height: u64, merkle_root: &[u8]) {
        let block_hash = format!("{:064x}", height);
        let mut displayed = merkle_root.to_vec();
        displayed.reverse();
        Mock::given(method("GET"))
            .and(path(format!("/block-height/{}", height)))
            .respond_with(ResponseTemplate::new(200).set_body_string(block_hash.clone()))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/block/{}", block_hash)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": block_hash,
                "height": height,
                "merkle_root": hex::encode(displayed),
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_submit_wraps_calendar_answer() {
        let server = MockServer::start().await;
        let digest = [0x42u8; 32];
        Mock::given(method("POST"))
            .and(path("/digest"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(pending_response(&digest).to_bytes()))
            .expect(1)
            .mount(&server)
            .await;

        let client = CalendarClient::new(server.uri(), Duration::from_secs(5));
        let artifact = client.submit(&digest).await.unwrap();
        assert_eq!(DetachedTimestamp::decode(&artifact).unwrap().digest, digest);
        assert_eq!(
            client.verify(&digest, &artifact).await.unwrap(),
            Attestation::Pending
        );
    }

    #[tokio::test]
    async fn test_submit_rejects_garbage_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/digest"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a timestamp".to_vec()))
            .mount(&server)
            .await;

        let client = CalendarClient::new(server.uri(), Duration::from_secs(5));
        assert!(matches!(
            client.submit(&[0u8; 32]).await,
            Err(LedgerError::ServiceError(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_surfaces_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/digest"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = CalendarClient::new(server.uri(), Duration::from_secs(5));
        assert!(matches!(
            client.submit(&[0u8; 32]).await,
            Err(LedgerError::ServiceError(_))
        ));
    }

    #[tokio::test]
    async fn test_upgrade_fetches_pending_commitment() {
        let server = MockServer::start().await;
        let digest = [0x11u8; 32];
        let commitment = commitment_of(&digest);
        Mock::given(method("GET"))
            .and(path(format!("/timestamp/{}", hex::encode(&commitment))))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(mined_response(&commitment, 800_000).to_bytes()))
            .mount(&server)
            .await;

        let client = CalendarClient::new(format!("{}/", server.uri()), Duration::from_secs(5));
        let pending = DetachedTimestamp::new(digest, pending_response(&digest)).unwrap().to_bytes();
        let UpgradeOutcome::Upgraded(upgraded) = client.upgrade(&digest, &pending).await.unwrap() else {
            panic!("expected upgrade");
        };
        assert_eq!(
            client.verify(&digest, &upgraded).await.unwrap(),
            Attestation::Confirmed { block_height: 800_000 }
        );
        assert_eq!(
            client.upgrade(&digest, &upgraded).await.unwrap(),
            UpgradeOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_upgrade_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = CalendarClient::new(server.uri(), Duration::from_secs(5));
        let digest = [0u8; 32];
        let pending = DetachedTimestamp::new(digest, pending_response(&digest)).unwrap().to_bytes();
        assert_eq!(
            client.upgrade(&digest, &pending).await.unwrap(),
            UpgradeOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_attestation_for_another_digest_is_invalid() {
        let client = CalendarClient::new("https://calendar.invalid", Duration::from_secs(5));
        let artifact = confirmed_artifact([0x01; 32], 5);

        assert_eq!(
            client.verify(&[0x01; 32], &artifact).await.unwrap(),
            Attestation::Confirmed { block_height: 5 }
        );
        assert!(matches!(
            client.verify(&[0xff; 32], &artifact).await.unwrap(),
            Attestation::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn test_loose_attestation_bytes_are_invalid() {
        let client = CalendarClient::new("https://calendar.invalid", Duration::from_secs(5));
        let mut forged = b"arbitrary bytes".to_vec();
        forged.extend_from_slice(&BITCOIN_TAG);
        forged.extend_from_slice(&[0x03, 0x05]);

        for digest in [[0u8; 32], [0xffu8; 32]] {
            assert!(matches!(
                client.verify(&digest, &forged).await.unwrap(),
                Attestation::Invalid(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_explorer_checks_block_merkle_root() {
        let server = MockServer::start().await;
        let digest = [0x33u8; 32];
        let attested_root = Sha256::digest(commitment_of(&digest)).to_vec();
        mount_block(&server, 100, &attested_root).await;
        mount_block(&server, 101, &[0x77; 32]).await;

        let client = CalendarClient::new("https://calendar.invalid", Duration::from_secs(5))
            .with_explorer(BlockExplorer::new(server.uri(), Duration::from_secs(5)));

        assert_eq!(
            client.verify(&digest, &confirmed_artifact(digest, 100)).await.unwrap(),
            Attestation::Confirmed { block_height: 100 }
        );

        // well formed and bound to the digest, but block 101 committed something else
        assert!(matches!(
            client.verify(&digest, &confirmed_artifact(digest, 101)).await.unwrap(),
            Attestation::Invalid(_)
        ));
    }
}
