//! attachment-crypto 命令行入口
//!
//! 用法：
//!   attachment-crypto keygen
//!   attachment-crypto encrypt <input> [output] --keys <hex>
//!   attachment-crypto decrypt <input> [output] --keys <hex> --size <n> --digest <hex>
//!   attachment-crypto wrap <input> <output> --outer-keys <hex>
//!   attachment-crypto reencrypt-backup <input> <output> --keys <hex> --iv <hex> --digest <hex>
//!   attachment-crypto size <len>
//!   attachment-crypto hash <file>
//!
//! 说明：
//! - 密钥为 64 字节，十六进制编码，可来自环境变量
//!   （`ATTACHMENT_KEYS`、`ATTACHMENT_OUTER_KEYS`）
//! - 未给出输出路径时，`encrypt` 与 `decrypt` 写入 `ATTACHMENT_STORE` 指向的存储

use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Context;
use attachment_crypto::format::padding::{ciphertext_len, padded_size, total_framed_len};
use attachment_crypto::format::{DIGEST_LEN, Digest};
use attachment_crypto::stream::DEFAULT_CHUNK_SIZE;
use attachment_crypto::{
    AttachmentDecryptor, AttachmentEncryptor, AttachmentError, AttachmentKeys, AttachmentStore,
    DecryptedAttachment, EncryptedAttachment, IntegrityCheck, Source, StreamConfig,
    plaintext_hash_of, reencrypt_for_backup, wrap_outer_layer,
};
use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_SUCCESS: i32 = 0;
const EXIT_OTHER: i32 = 1;
const EXIT_CLI: i32 = 2;
const EXIT_INTEGRITY: i32 = 3;
const EXIT_IO: i32 = 4;

#[derive(Parser, Debug)]
#[command(name = "attachment-crypto", version, about = "Streaming attachment encryption")]
struct Cli {
    /// Read size of the streaming pipeline, in bytes.
    #[arg(long, global = true, env = "ATTACHMENT_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct KeyArgs {
    /// 64-byte key blob, hex encoded.
    #[arg(long, env = "ATTACHMENT_KEYS", hide_env_values = true)]
    keys: String,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Store root used when no output path is given.
    #[arg(long, env = "ATTACHMENT_STORE")]
    store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a fresh 64-byte key blob
    Keygen,
    /// Encrypt a plaintext file
    Encrypt {
        input: PathBuf,
        output: Option<PathBuf>,
        #[command(flatten)]
        keys: KeyArgs,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Decrypt and verify an attachment
    Decrypt {
        input: PathBuf,
        output: Option<PathBuf>,
        #[command(flatten)]
        keys: KeyArgs,
        /// Outer envelope keys, for backup downloads.
        #[arg(long, env = "ATTACHMENT_OUTER_KEYS", hide_env_values = true)]
        outer_keys: Option<String>,
        /// Declared plaintext size.
        #[arg(long)]
        size: u64,
        /// Expected digest, hex encoded.
        #[arg(long, conflicts_with_all = ["plaintext_hash", "local"])]
        digest: Option<String>,
        /// Expected plaintext SHA-256, hex encoded.
        #[arg(long, conflicts_with = "local")]
        plaintext_hash: Option<String>,
        /// The attachment was produced locally; check the MAC only.
        #[arg(long)]
        local: bool,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Wrap an encrypted attachment in an outer envelope
    Wrap {
        input: PathBuf,
        output: PathBuf,
        #[arg(long, env = "ATTACHMENT_OUTER_KEYS", hide_env_values = true)]
        outer_keys: String,
    },
    /// Re-encrypt a plaintext with its original IV and check the digest
    ReencryptBackup {
        input: PathBuf,
        output: PathBuf,
        #[command(flatten)]
        keys: KeyArgs,
        #[arg(long)]
        iv: String,
        #[arg(long)]
        digest: String,
    },
    /// Print the padding bucket and framed size for a plaintext length
    Size { length: u64 },
    /// Print the plaintext hash of a file
    Hash { input: PathBuf },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Attachment(#[from] AttachmentError),
    #[error("{0:#}")]
    Usage(#[from] anyhow::Error),
}

fn main() {
    let exit_code = run();
    std::process::exit(exit_code);
}

fn run() -> i32 {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { EXIT_CLI } else { EXIT_SUCCESS };
        }
    };

    let config = StreamConfig::default().with_chunk_size(cli.chunk_size);

    let result = match cli.command {
        Commands::Keygen => cmd_keygen(),
        Commands::Encrypt {
            input,
            output,
            keys,
            store,
        } => cmd_encrypt(&input, output.as_deref(), &keys, &store, &config),
        Commands::Decrypt {
            input,
            output,
            keys,
            outer_keys,
            size,
            digest,
            plaintext_hash,
            local,
            store,
        } => integrity_check(digest, plaintext_hash, local).and_then(|integrity| {
            cmd_decrypt(
                &input,
                output.as_deref(),
                &keys,
                outer_keys.as_deref(),
                size,
                integrity,
                &store,
                &config,
            )
        }),
        Commands::Wrap {
            input,
            output,
            outer_keys,
        } => cmd_wrap(&input, &output, &outer_keys, &config),
        Commands::ReencryptBackup {
            input,
            output,
            keys,
            iv,
            digest,
        } => cmd_reencrypt_backup(&input, &output, &keys, &iv, &digest, &config),
        Commands::Size { length } => cmd_size(length),
        Commands::Hash { input } => cmd_hash(&input, &config),
    };

    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(err) => {
            report_error(&err);
            map_exit_code(&err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn report_error(err: &CliError) {
    error!(error = %err, "command failed");
    eprintln!("error: {err}");
}

fn map_exit_code(err: &CliError) -> i32 {
    match err {
        CliError::Usage(_) => EXIT_CLI,
        CliError::Attachment(err) if err.is_integrity_failure() => EXIT_INTEGRITY,
        CliError::Attachment(AttachmentError::ReencryptedDigestMismatch) => EXIT_INTEGRITY,
        CliError::Attachment(AttachmentError::Io { .. }) => EXIT_IO,
        CliError::Attachment(
            AttachmentError::InvalidKeyLength { .. }
            | AttachmentError::InvalidConfig(_)
            | AttachmentError::UnsafePath(_)
            | AttachmentError::UnsafeMode(_),
        ) => EXIT_CLI,
        CliError::Attachment(_) => EXIT_OTHER,
    }
}

fn parse_keys(hex_keys: &str, what: &str) -> Result<AttachmentKeys, CliError> {
    AttachmentKeys::from_hex(hex_keys)
        .with_context(|| format!("parsing {what}"))
        .map_err(CliError::from)
}

fn parse_digest(encoded: &str) -> Result<Digest, CliError> {
    let bytes = hex::decode(encoded.trim()).context("digest is not hex")?;
    let digest = Digest::try_from(bytes.as_slice())
        .map_err(|_| anyhow::anyhow!("digest must be {DIGEST_LEN} bytes, got {}", bytes.len()))?;
    Ok(digest)
}

fn integrity_check(
    digest: Option<String>,
    plaintext_hash: Option<String>,
    local: bool,
) -> Result<IntegrityCheck, CliError> {
    match (digest, plaintext_hash, local) {
        (Some(digest), _, _) => Ok(IntegrityCheck::Digest(parse_digest(&digest)?)),
        (None, Some(hash), _) => Ok(IntegrityCheck::PlaintextHash(hash)),
        (None, None, true) => Ok(IntegrityCheck::LocallyGenerated),
        (None, None, false) => Err(anyhow::anyhow!(
            "one of --digest, --plaintext-hash or --local is required"
        )
        .into()),
    }
}

fn require_store(store: &StoreArgs) -> Result<AttachmentStore, CliError> {
    let root = store
        .store
        .as_ref()
        .context("no output path given and no --store / ATTACHMENT_STORE set")?;
    Ok(AttachmentStore::new(root))
}

fn cmd_keygen() -> Result<(), CliError> {
    let keys = AttachmentKeys::generate();
    println!("{}", keys.to_hex());
    Ok(())
}

fn cmd_encrypt(
    input: &Path,
    output: Option<&Path>,
    keys: &KeyArgs,
    store: &StoreArgs,
    config: &StreamConfig,
) -> Result<(), CliError> {
    let keys = parse_keys(&keys.keys, "--keys")?;
    info!(input = %input.display(), "encrypting attachment");

    let (path, encrypted) = match output {
        Some(output) => {
            let encrypted = attachment_crypto::encrypt_file(input, output, keys.material(), config)?;
            (output.to_path_buf(), encrypted)
        }
        None => {
            let store = require_store(store)?;
            let encryptor = AttachmentEncryptor::new(keys.material())
                .with_config(config.clone())
                .with_log_id(input.display().to_string());
            let stored = store.encrypt_to_disk(Source::Path(input), &encryptor)?;
            (stored.path, stored.encrypted)
        }
    };

    println!("path: {}", path.display());
    print_encrypted(&encrypted);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_decrypt(
    input: &Path,
    output: Option<&Path>,
    keys: &KeyArgs,
    outer_keys: Option<&str>,
    size: u64,
    integrity: IntegrityCheck,
    store: &StoreArgs,
    config: &StreamConfig,
) -> Result<(), CliError> {
    let keys = parse_keys(&keys.keys, "--keys")?;
    let outer_keys = outer_keys
        .map(|hex_keys| parse_keys(hex_keys, "--outer-keys"))
        .transpose()?;

    let mut decryptor = AttachmentDecryptor::new(keys.material(), size, integrity)
        .with_config(config.clone())
        .with_log_id(input.display().to_string());
    if let Some(outer) = &outer_keys {
        decryptor = decryptor.with_outer_layer(outer.material());
    }

    info!(input = %input.display(), "decrypting attachment");
    let (path, decrypted) = match output {
        Some(output) => {
            let decrypted = attachment_crypto::decrypt_file(input, output, &decryptor)?;
            (output.to_path_buf(), decrypted)
        }
        None => {
            let store = require_store(store)?;
            let file = store.decrypt_to_disk(Source::Path(input), &decryptor)?;
            (file.path, file.decrypted)
        }
    };

    println!("path: {}", path.display());
    print_decrypted(&decrypted);
    Ok(())
}

fn cmd_wrap(
    input: &Path,
    output: &Path,
    outer_keys: &str,
    config: &StreamConfig,
) -> Result<(), CliError> {
    let outer_keys = parse_keys(outer_keys, "--outer-keys")?;
    info!(input = %input.display(), "wrapping attachment in an outer envelope");

    let wrapped = attachment_crypto::fs::write_atomic(output, |file| {
        wrap_outer_layer(
            Source::Path(input),
            outer_keys.material(),
            BufWriter::new(file),
            config,
        )
    })?;

    print_encrypted(&wrapped);
    Ok(())
}

fn cmd_reencrypt_backup(
    input: &Path,
    output: &Path,
    keys: &KeyArgs,
    iv: &str,
    digest: &str,
    config: &StreamConfig,
) -> Result<(), CliError> {
    let keys = parse_keys(&keys.keys, "--keys")?;
    let iv = hex::decode(iv.trim()).context("--iv is not hex")?;
    let digest = hex::decode(digest.trim()).context("--digest is not hex")?;

    let encrypted = attachment_crypto::fs::write_atomic(output, |file| {
        reencrypt_for_backup(
            Source::Path(input),
            keys.material(),
            &iv,
            &digest,
            BufWriter::new(file),
            config,
        )
    })?;

    print_encrypted(&encrypted);
    Ok(())
}

fn cmd_size(length: u64) -> Result<(), CliError> {
    let bucket = padded_size(length);
    let (Some(ciphertext), Some(framed)) = (ciphertext_len(bucket), total_framed_len(length)) else {
        return Err(anyhow::anyhow!("plaintext length {length} is too large to encrypt").into());
    };

    println!("plaintext: {length}");
    println!("bucket: {bucket}");
    println!("ciphertext: {ciphertext}");
    println!("framed: {framed}");
    Ok(())
}

fn cmd_hash(input: &Path, config: &StreamConfig) -> Result<(), CliError> {
    let hash = plaintext_hash_of(Source::Path(input), config)?;
    println!("{hash}");
    Ok(())
}

fn print_encrypted(encrypted: &EncryptedAttachment) {
    println!("digest: {}", hex::encode(encrypted.digest));
    println!("iv: {}", hex::encode(encrypted.iv));
    println!("plaintext_hash: {}", encrypted.plaintext_hash);
    println!("plaintext_size: {}", encrypted.plaintext_size);
    println!("ciphertext_size: {}", encrypted.ciphertext_size);
}

fn print_decrypted(decrypted: &DecryptedAttachment) {
    println!("digest: {}", hex::encode(decrypted.digest));
    println!("plaintext_hash: {}", decrypted.plaintext_hash);
    println!("plaintext_size: {}", decrypted.plaintext_size);
}
