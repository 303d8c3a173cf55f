//! ALFA Identity Vault - Enrollment & Verification
//!
//! Capture -> embedding -> helper -> envelope-encrypted record, and the two
//! ways of checking a stored record later:
//! - commitment check: decrypt the helper, recompute H(K), compare
//! - template match: decrypt the template, compare against a fresh probe
//!
//! Enrollment is all-or-nothing: if the record cannot be stored, the saved
//! sample image is removed again. Samples are stored sealed under their
//! record key, never in the clear.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::blob_store::BlobStore;
use crate::crypto::derive_secret;
use crate::error::{IdentityError, IdentityResult};
use crate::matcher::{self, MatchOutcome};
use crate::record::{EncryptedRecord, SealedSample};
use crate::session::Session;
use crate::store::RecordStore;
use crate::template::{compute_identity_commitment, create_helper, Embedding, Helper};

/// Face embedding extractor (external model)
pub trait EmbeddingExtractor: Send + Sync {
    /// `None` means no usable face in the frame
    fn extract(&self, frame: &[u8]) -> IdentityResult<Option<Embedding>>;
}

/// Result of identifying a probe among stored records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub record_id: String,
    pub label: Option<String>,
    pub outcome: MatchOutcome,
}

/// Identification result plus the records that could not take part
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentifyOutcome {
    pub found: Option<Identification>,
    /// Records this session could not open or whose dimension differs
    pub skipped: Vec<String>,
}

/// Recompute the commitment from the decrypted helper and compare
///
/// Also re-derives K from template and salt, so a helper whose secret does
/// not belong to its template fails the check.
pub fn verify_commitment(session: &Session, record: &EncryptedRecord) -> IdentityResult<bool> {
    let helper = record.open(session)?;

    let recomputed = derive_secret(&helper.template, &helper.salt, helper.derived_secret.len() * 8)?;
    if recomputed.expose() != helper.derived_secret.as_slice() {
        log::warn!("Record {} helper secret does not match its template", record.id);
        return Ok(false);
    }

    Ok(compute_identity_commitment(recomputed.expose()) == record.identity_commitment)
}

/// Match a fresh probe against the template stored in `record`
pub fn verify_by_matching(
    session: &Session,
    record: &EncryptedRecord,
    probe: &Embedding,
    tolerance: f64,
) -> IdentityResult<MatchOutcome> {
    let enrolled = record.open(session)?.embedding()?;
    matcher::is_match(&enrolled, probe, tolerance)
}

/// Enrollment front-end over a record store and optional sample storage
pub struct Enroller {
    store: Arc<dyn RecordStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    embedding_dim: usize,
}

impl Enroller {
    pub fn new(store: Arc<dyn RecordStore>, embedding_dim: usize) -> Self {
        Self {
            store,
            blobs: None,
            embedding_dim,
        }
    }

    /// Keep raw sample images in `blobs`
    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Extract an embedding from a captured frame and enroll it
    pub fn enroll_frame(
        &self,
        session: &Session,
        extractor: &dyn EmbeddingExtractor,
        frame: &[u8],
        label: Option<String>,
    ) -> IdentityResult<EncryptedRecord> {
        let embedding = extractor.extract(frame)?.ok_or(IdentityError::NoFaceDetected)?;
        self.enroll_embedding(session, &embedding, label, Some(frame))
    }

    /// Protect an embedding and persist it as a pending record
    pub fn enroll_embedding(
        &self,
        session: &Session,
        embedding: &Embedding,
        label: Option<String>,
        sample: Option<&[u8]>,
    ) -> IdentityResult<EncryptedRecord> {
        embedding.ensure_dim(self.embedding_dim)?;
        if !session.is_active() {
            return Err(IdentityError::SessionClosed);
        }

        let helper = create_helper(embedding)?;
        let mut record = EncryptedRecord::seal(session, &helper, label)?;

        if let Some(bytes) = sample {
            match &self.blobs {
                Some(blobs) => {
                    let sealed = record.seal_sample(session, bytes)?;
                    record.sample_key = Some(blobs.save(&sealed.to_bytes()?)?);
                }
                None => log::debug!("No blob store configured, sample not kept"),
            }
        }

        match self.store.put(&record) {
            Ok(()) => {
                log::info!("Enrolled record {} ({})", record.id, record.identity_commitment);
                Ok(record)
            }
            Err(e) => {
                if let (Some(key), Some(blobs)) = (&record.sample_key, &self.blobs) {
                    if let Err(cleanup) = blobs.delete(key) {
                        log::warn!("Could not remove sample {} after failed enrollment: {}", key, cleanup);
                    }
                }
                Err(e)
            }
        }
    }

    fn load(&self, id: &str) -> IdentityResult<EncryptedRecord> {
        self.store
            .get(id)?
            .ok_or_else(|| IdentityError::RecordNotFound(id.to_string()))
    }

    /// Decrypt the helper of a stored record
    pub fn open_helper(&self, session: &Session, id: &str) -> IdentityResult<Helper> {
        self.load(id)?.open(session)
    }

    /// Decrypt the sample image of a stored record, if one is kept
    pub fn load_sample(&self, session: &Session, id: &str) -> IdentityResult<Option<Zeroizing<Vec<u8>>>> {
        let record = self.load(id)?;
        let (Some(key), Some(blobs)) = (&record.sample_key, &self.blobs) else {
            return Ok(None);
        };
        let Some(bytes) = blobs.load(key)? else {
            return Ok(None);
        };
        let sealed = SealedSample::from_bytes(&bytes)?;
        Ok(Some(record.open_sample(session, &sealed)?))
    }

    pub fn verify_commitment(&self, session: &Session, id: &str) -> IdentityResult<bool> {
        verify_commitment(session, &self.load(id)?)
    }

    pub fn verify_by_matching(
        &self,
        session: &Session,
        id: &str,
        probe: &Embedding,
        tolerance: f64,
    ) -> IdentityResult<MatchOutcome> {
        verify_by_matching(session, &self.load(id)?, probe, tolerance)
    }

    /// Closest stored record within tolerance
    ///
    /// Records this session cannot open are skipped and listed in the outcome.
    pub fn identify(
        &self,
        session: &Session,
        probe: &Embedding,
        tolerance: f64,
    ) -> IdentityResult<IdentifyOutcome> {
        let records = self.store.get_all()?;

        let mut candidates = Vec::with_capacity(records.len());
        let mut owners = Vec::with_capacity(records.len());
        let mut skipped = Vec::new();
        for record in &records {
            match record.open(session).and_then(|h| h.embedding()) {
                Ok(embedding) if embedding.len() == probe.len() => {
                    candidates.push(embedding);
                    owners.push(record);
                }
                Ok(embedding) => {
                    log::warn!(
                        "Record {} has dimension {}, probe has {}",
                        record.id,
                        embedding.len(),
                        probe.len()
                    );
                    skipped.push(record.id.clone());
                }
                Err(IdentityError::SessionClosed) => return Err(IdentityError::SessionClosed),
                Err(e) => {
                    log::warn!("Skipping record {}: {}", record.id, e);
                    skipped.push(record.id.clone());
                }
            }
        }

        let found = matcher::best_match(probe, &candidates, tolerance)?.map(|(idx, outcome)| {
            Identification {
                record_id: owners[idx].id.clone(),
                label: owners[idx].label.clone(),
                outcome,
            }
        });
        Ok(IdentifyOutcome { found, skipped })
    }

    /// Delete a record and its sample image; returns whether it existed
    pub fn delete_record(&self, id: &str) -> IdentityResult<bool> {
        let Some(record) = self.store.get(id)? else {
            return Ok(false);
        };

        if let (Some(key), Some(blobs)) = (&record.sample_key, &self.blobs) {
            blobs.delete(key)?;
        }
        self.store.delete(id)?;
        log::info!("Deleted record {}", id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use crate::store::MemoryRecordStore;
    use crate::template::EMBEDDING_DIM;
    use crate::testing::{sample_embedding, shifted, test_session};

    /// Treats any non-empty frame as the sample face
    struct FixedExtractor;

    impl EmbeddingExtractor for FixedExtractor {
        fn extract(&self, frame: &[u8]) -> IdentityResult<Option<Embedding>> {
            Ok((!frame.is_empty()).then(sample_embedding))
        }
    }

    /// Store whose writes always fail
    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn put(&self, _: &EncryptedRecord) -> IdentityResult<()> {
            Err(IdentityError::Database("disk full".into()))
        }
        fn get(&self, _: &str) -> IdentityResult<Option<EncryptedRecord>> {
            Ok(None)
        }
        fn get_all(&self) -> IdentityResult<Vec<EncryptedRecord>> {
            Ok(Vec::new())
        }
        fn delete(&self, _: &str) -> IdentityResult<()> {
            Ok(())
        }
    }

    fn enroller() -> (Arc<MemoryRecordStore>, Arc<MemoryBlobStore>, Enroller) {
        let store = Arc::new(MemoryRecordStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let enroller = Enroller::new(store.clone(), EMBEDDING_DIM).with_blob_store(blobs.clone());
        (store, blobs, enroller)
    }

    #[test]
    fn test_enroll_and_verify() {
        let (store, _, enroller) = enroller();
        let session = test_session();

        let record = enroller
            .enroll_embedding(&session, &sample_embedding(), Some("alice".into()), None)
            .unwrap();
        assert!(record.is_pending());
        assert_eq!(store.get_all().unwrap().len(), 1);

        assert!(enroller.verify_commitment(&session, &record.id).unwrap());

        let close = shifted(&sample_embedding(), 0.3);
        let outcome = enroller.verify_by_matching(&session, &record.id, &close, 0.5).unwrap();
        assert!(outcome.matched);
        assert!((outcome.distance - 0.3).abs() < 1e-5);

        let far = shifted(&sample_embedding(), 0.8);
        assert!(!enroller.verify_by_matching(&session, &record.id, &far, 0.5).unwrap().matched);
    }

    #[test]
    fn test_commitment_mismatch_detected() {
        let (_, _, enroller) = enroller();
        let session = test_session();
        let mut record = enroller
            .enroll_embedding(&session, &sample_embedding(), None, None)
            .unwrap();

        record.identity_commitment = compute_identity_commitment(b"someone else");
        assert!(!verify_commitment(&session, &record).unwrap());
    }

    #[test]
    fn test_wrong_session_cannot_verify() {
        let (_, _, enroller) = enroller();
        let record = enroller
            .enroll_embedding(&test_session(), &sample_embedding(), None, None)
            .unwrap();

        let err = enroller.verify_commitment(&test_session(), &record.id).unwrap_err();
        assert!(err.is_security_critical());
    }

    #[test]
    fn test_no_face_detected() {
        let (store, blobs, enroller) = enroller();
        let result = enroller.enroll_frame(&test_session(), &FixedExtractor, b"", None);

        assert!(matches!(result, Err(IdentityError::NoFaceDetected)));
        assert!(store.get_all().unwrap().is_empty());
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_frame_sample_kept_and_deleted_with_record() {
        let (store, blobs, enroller) = enroller();
        let session = test_session();
        let record = enroller
            .enroll_frame(&session, &FixedExtractor, b"jpeg-frame", None)
            .unwrap();

        let key = record.sample_key.clone().unwrap();
        let stored = blobs.load(&key).unwrap().unwrap();
        assert!(!stored.windows(10).any(|w| w == b"jpeg-frame"));
        assert_eq!(
            &*enroller.load_sample(&session, &record.id).unwrap().unwrap(),
            b"jpeg-frame"
        );

        assert!(enroller.delete_record(&record.id).unwrap());
        assert!(blobs.load(&key).unwrap().is_none());
        assert!(store.get(&record.id).unwrap().is_none());
        assert!(!enroller.delete_record(&record.id).unwrap());
    }

    #[test]
    fn test_failed_store_leaves_nothing_behind() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let enroller = Enroller::new(Arc::new(BrokenStore), EMBEDDING_DIM).with_blob_store(blobs.clone());

        let result = enroller.enroll_frame(&test_session(), &FixedExtractor, b"jpeg", None);
        assert!(matches!(result, Err(IdentityError::Database(_))));
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_closed_session_and_bad_dimension() {
        let (store, blobs, enroller) = enroller();
        let session = test_session();
        session.end();

        assert!(matches!(
            enroller.enroll_embedding(&session, &sample_embedding(), None, Some(b"x")),
            Err(IdentityError::SessionClosed)
        ));
        assert!(matches!(
            enroller.enroll_embedding(&test_session(), &Embedding::new(vec![0.5; 64]).unwrap(), None, None),
            Err(IdentityError::DimensionMismatch { .. })
        ));
        assert!(store.get_all().unwrap().is_empty());
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_identify_picks_closest() {
        let (_, _, enroller) = enroller();
        let session = test_session();

        let alice = sample_embedding();
        let bob = shifted(&alice, 2.0);
        enroller.enroll_embedding(&session, &alice, Some("alice".into()), None).unwrap();
        let bob_record = enroller
            .enroll_embedding(&session, &bob, Some("bob".into()), None)
            .unwrap();

        let probe = shifted(&bob, 0.1);
        let result = enroller.identify(&session, &probe, 0.5).unwrap();
        assert!(result.skipped.is_empty());
        let found = result.found.unwrap();
        assert_eq!(found.record_id, bob_record.id);
        assert_eq!(found.label.as_deref(), Some("bob"));

        let stranger = shifted(&alice, 5.0);
        assert!(enroller.identify(&session, &stranger, 0.5).unwrap().found.is_none());
    }

    #[test]
    fn test_identify_reports_foreign_records() {
        let (_, _, enroller) = enroller();
        let mine = test_session();
        let own = enroller
            .enroll_embedding(&mine, &shifted(&sample_embedding(), 0.2), None, None)
            .unwrap();
        let foreign = enroller
            .enroll_embedding(&test_session(), &sample_embedding(), None, None)
            .unwrap();

        let result = enroller.identify(&mine, &sample_embedding(), 0.5).unwrap();
        assert_eq!(result.found.unwrap().record_id, own.id);
        assert_eq!(result.skipped, vec![foreign.id]);
    }
}
