//! Command implementations for the vaporchat CLI.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use vaporchat_core::config::ControllerConfig;
use vaporchat_core::crypto::{DhKeypair, LocalIdentity, PreKeyBundle, RoomId, SigningKeypair};
use vaporchat_core::session::{ChatEvent, ConnectionStatus, SessionController, TransferEvent};
use vaporchat_core::swarm::TcpSwarm;

/// Generate an identity, store its secrets, print the public bundle.
pub fn keygen(out: &Path) -> Result<()> {
    let identity = LocalIdentity::generate();

    let mut secrets = Vec::with_capacity(64);
    secrets.extend_from_slice(&identity.dh.secret_bytes());
    secrets.extend_from_slice(&identity.signing.secret_bytes());
    std::fs::write(out, STANDARD.encode(&secrets))
        .with_context(|| format!("writing {}", out.display()))?;

    println!("identity written to {}", out.display());
    println!("share this bundle with your peers:");
    println!("{}", STANDARD.encode(identity.bundle().to_bytes()));
    Ok(())
}

fn load_identity(path: &Path) -> Result<LocalIdentity> {
    let encoded =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let secrets = STANDARD
        .decode(encoded.trim())
        .context("identity file is not valid base64")?;
    if secrets.len() != 64 {
        bail!("identity file must decode to 64 bytes");
    }
    let mut dh = [0u8; 32];
    let mut sig = [0u8; 32];
    dh.copy_from_slice(&secrets[..32]);
    sig.copy_from_slice(&secrets[32..]);
    Ok(LocalIdentity {
        dh: DhKeypair::from_secret_bytes(dh),
        signing: SigningKeypair::from_secret_bytes(sig),
    })
}

fn parse_bundle(encoded: &str) -> Result<PreKeyBundle> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("bundle is not valid base64")?;
    PreKeyBundle::from_bytes(&bytes).map_err(|e| anyhow::anyhow!("bad bundle: {e}"))
}

/// Join a room and chat on stdin/stdout until interrupted.
pub async fn join(
    room: &str,
    identity_path: &Path,
    bundle: &str,
    bind: &str,
    peers: Vec<String>,
    downloads: PathBuf,
) -> Result<()> {
    let identity = load_identity(identity_path)?;
    let peer_bundle = parse_bundle(bundle)?;
    let room = RoomId::new(room).map_err(|e| anyhow::anyhow!("bad room id: {e}"))?;

    let mut config = ControllerConfig::new(room, identity, peer_bundle);
    config.download_dir = downloads;

    let swarm = std::sync::Arc::new(TcpSwarm::new(bind, peers));
    let controller = SessionController::new(config, swarm.clone());
    let mut events = controller.subscribe();

    controller
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("start failed: {e}"))?;
    if let Some(addr) = swarm.local_addr().await {
        println!("listening on {addr}");
    }
    println!("type a message, '/file <path>' to send a file, '/quit' to leave");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => print_event(event),
                    Err(_) => break,
                }
            }
            line = stdin.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Some(path) = line.strip_prefix("/file ") {
                    match controller.send_file(PathBuf::from(path)).await {
                        Ok(metadata) => println!(
                            "» sending {} ({} bytes, {} chunks)",
                            metadata.filename, metadata.size, metadata.total_chunks
                        ),
                        Err(e) => eprintln!("! file send failed: {e}"),
                    }
                    continue;
                }
                if let Err(e) = controller.send(&line).await {
                    eprintln!("! send failed: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller
        .cleanup()
        .await
        .map_err(|e| anyhow::anyhow!("cleanup failed: {e}"))?;
    println!("left the room");
    Ok(())
}

fn print_event(event: ChatEvent) {
    match event {
        ChatEvent::Message { peer, content, .. } => println!("[{peer}] {content}"),
        ChatEvent::ConnectionStatus(status) => match status {
            ConnectionStatus::Connecting => println!("· connecting"),
            ConnectionStatus::Connected => println!("· peer verified"),
            ConnectionStatus::Disconnected => println!("· disconnected"),
        },
        ChatEvent::BackendError { kind, message } => eprintln!("! {kind}: {message}"),
        ChatEvent::PeerDelivery {
            peer, success: false, ..
        } => eprintln!("! delivery to {peer} failed"),
        ChatEvent::PeerDelivery { .. } => {}
        ChatEvent::Transfer(event) => match event {
            TransferEvent::Progress { bytes, total, .. } => {
                eprintln!("· transfer {bytes}/{total} bytes")
            }
            TransferEvent::Received { path, .. } => println!("» file saved to {}", path.display()),
            TransferEvent::Completed { .. } => println!("» file delivered"),
            TransferEvent::Failed { error, .. } => eprintln!("! transfer failed: {error}"),
            TransferEvent::Started { metadata } => {
                eprintln!("· transfer {} started", metadata.filename)
            }
        },
    }
}
