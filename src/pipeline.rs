//! A fixed-size worker pool that offloads per-chunk encryption/hashing off
//! the internal lane (SPEC_FULL §5), the same shape as
//! `asuran::repository::pipeline::Pipeline`: a bounded
//! `futures_intrusive` channel feeding a handful of tasks, each unit of
//! work carrying its own one-shot reply channel.
use futures_intrusive::channel::shared::{channel, oneshot_channel, OneshotSender, Sender};
use lv_core::crypto::Iv;
use lv_core::{CiphertextHash, CryptoError};
use tokio::task;
use tracing::instrument;

struct Job {
    plaintext: Vec<u8>,
    encryption_key: [u8; 32],
    iv: Iv,
    ret: OneshotSender<Result<ChunkDigest, CryptoError>>,
}

/// The result of encrypting and addressing one chunk's plaintext.
///
/// `plaintext_hash` is always computed here; whether a caller actually
/// stores it on the resulting `ChunkInfo` is gated on capability level by
/// the caller (`Indexer` only ever runs at `Owner`, so this is moot in
/// practice — see DESIGN.md's Open Question 4).
#[derive(Clone, Debug)]
pub struct ChunkDigest {
    pub ciphertext_hash: CiphertextHash,
    pub plaintext_hash: [u8; 32],
}

#[derive(Clone)]
pub struct Pipeline {
    input: Sender<Job>,
}

impl Pipeline {
    /// Spawns `worker_count` tasks draining a shared bounded channel.
    pub fn new(worker_count: usize) -> Pipeline {
        let worker_count = worker_count.max(1);
        // Same rough sizing asuran's Pipeline uses for its queue depth.
        let queue_depth = (worker_count * 3) / 2 + 1;
        let (input, rx) = channel(queue_depth);

        for _ in 0..worker_count {
            let rx = rx.clone();
            task::spawn(async move {
                while let Some(job) = rx.receive().await {
                    task::block_in_place(|| {
                        let result = encrypt_and_digest(&job.plaintext, &job.encryption_key, &job.iv);
                        // If the caller has gone away there is nothing left
                        // to do with the result; let this worker move on.
                        let _ = job.ret.send(result);
                    });
                }
            });
        }
        Pipeline { input }
    }

    /// Encrypts `plaintext` under `encryption_key`/`iv` and returns its
    /// ciphertext address alongside a keyed plaintext hash, on the worker
    /// pool rather than the caller's task.
    #[instrument(skip(self, plaintext, encryption_key))]
    pub async fn digest(
        &self,
        plaintext: Vec<u8>,
        encryption_key: [u8; 32],
        iv: Iv,
    ) -> Result<ChunkDigest, CryptoError> {
        let (ret, rx) = oneshot_channel();
        let job = Job {
            plaintext,
            encryption_key,
            iv,
            ret,
        };
        self.input
            .send(job)
            .await
            .expect("pipeline worker tasks are not supposed to exit while a Pipeline handle lives");
        rx.receive()
            .await
            .expect("pipeline worker dropped its reply channel without sending")
    }
}

fn encrypt_and_digest(plaintext: &[u8], encryption_key: &[u8; 32], iv: &Iv) -> Result<ChunkDigest, CryptoError> {
    let ciphertext = lv_core::crypto::aes_cbc_encrypt(encryption_key, iv, plaintext)?;
    let ciphertext_hash = CiphertextHash(lv_core::crypto::ciphertext_hash(&ciphertext));
    let plaintext_hash = lv_core::crypto::plaintext_hash(encryption_key, plaintext)?;
    Ok(ChunkDigest {
        ciphertext_hash,
        plaintext_hash,
    })
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(num_cpus::get_physical())
    }
}
