//! mfkit - MIFARE Classic analysis toolkit
//!
//! Command line front end for the library: offline key recovery from a
//! captured nested-authentication trace, tag PRNG arithmetic, frame CRC
//! helpers, and a self-contained demo that cracks the built-in simulated
//! card.

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mfkit::auth::{self, KeyType};
use mfkit::cipher::prng_successor;
use mfkit::recovery::{lfsr_recovery32, nonce_distance, recover_key_from_nonces};
use mfkit::sim::SimulatedCard;
use mfkit::ClassicDriver;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
usage: mfkit <command> [args]

commands:
  demo                                          crack the built-in simulated card
  recover <uid> <known-nt> <enc-nt> <key>       offline key recovery from a trace [--json]
  distance <nt1> <nt2>                          prng steps between two tag nonces
  suc <nonce> <steps>                           advance a tag nonce
  crc <hex-bytes>                               append the iso14443a crc to a frame

values are hex (0x prefix optional); <steps> is decimal";

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mfkit=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("demo") => cmd_demo(),
        Some("recover") => cmd_recover(&args[1..]),
        Some("distance") => cmd_distance(&args[1..]),
        Some("suc") => cmd_suc(&args[1..]),
        Some("crc") => cmd_crc(&args[1..]),
        Some("--version") | Some("-V") => {
            println!("mfkit {VERSION}");
            Ok(())
        }
        Some("help") | Some("--help") | Some("-h") | None => {
            println!("{USAGE}");
            Ok(())
        }
        Some(other) => {
            eprintln!("{USAGE}");
            bail!("unknown command: {other}");
        }
    }
}

fn parse_u32(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0x");
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid hex value: {s}"))
}

fn parse_key(s: &str) -> Result<u64> {
    let digits = s.trim_start_matches("0x");
    let key = u64::from_str_radix(digits, 16).with_context(|| format!("invalid hex key: {s}"))?;
    if key > 0xFFFF_FFFF_FFFF {
        bail!("key wider than 48 bits: {s}");
    }
    Ok(key)
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>> {
    let digits = s.trim_start_matches("0x");
    if digits.is_empty() || digits.len() % 2 != 0 {
        bail!("expected an even number of hex digits: {s}");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex byte in {s}"))
        })
        .collect()
}

/// Full walkthrough against the simulated card: capture a nested nonce,
/// recover candidate keys, verify them live, read a protected block.
///
/// The simulation's PRNG parameters are in hand here, so the plaintext of
/// the captured nonce is simply predicted from the seed. Against real
/// hardware that prediction comes from the calibration phase of
/// [`mfkit::NestedAttack`] instead.
fn cmd_demo() -> Result<()> {
    const UID: u32 = 0xCDB46EFB;
    const KNOWN_KEY: u64 = 0xA0A1A2A3A4A5;
    const SECRET_KEY: u64 = 0x4F2A1E96D3B8;
    const PRNG_SEED: u32 = 0x36C2A401;
    const PRNG_STEP: u32 = 64;

    let mut card = SimulatedCard::new(UID).with_prng(PRNG_SEED, PRNG_STEP);
    card.set_sector_keys(0, KNOWN_KEY, 0xFFFFFFFFFFFF);
    card.set_sector_keys(2, SECRET_KEY, 0xFFFFFFFFFFFF);
    card.write_block(8, *b"mfkit demo block");
    let mut driver = ClassicDriver::new(card, UID);

    println!("card uid       {UID:08x}");
    println!("known key A    {KNOWN_KEY:012x} (sector 0)");
    println!("target         sector 2, key A");

    let mut session = driver
        .authenticate(KeyType::KeyA, 0, KNOWN_KEY)
        .context("known-sector authentication")?;
    let encrypted_nt = driver
        .nested_auth(&mut session, KeyType::KeyA, 8)
        .context("nested authentication")?;
    println!("captured       {{nT}} = {encrypted_nt:08x}");

    // One nonce went to the first handshake, the second to the nested one.
    let nt = prng_successor(PRNG_SEED, 2 * PRNG_STEP);
    let input = UID ^ nt;
    let mut keys: Vec<u64> = lfsr_recovery32(encrypted_nt ^ nt, input)
        .into_iter()
        .map(|mut state| {
            state.lfsr_rollback_word(input, false);
            state.get_key()
        })
        .collect();
    keys.sort_unstable();
    keys.dedup();
    println!("recovered      {} candidate keys", keys.len());

    tracing::info!(candidates = keys.len(), "verifying against the card");
    let mut verified = None;
    for key in keys {
        driver.reconnect().context("reconnect")?;
        if driver.authenticate(KeyType::KeyA, 8, key).is_ok() {
            verified = Some(key);
            break;
        }
    }
    let Some(key) = verified else {
        bail!("no candidate key verified against the card");
    };
    println!("verified key   {key:012x}");

    driver.reconnect().context("reconnect")?;
    let mut session = driver
        .authenticate(KeyType::KeyA, 8, key)
        .context("authentication with the recovered key")?;
    let block = driver.read_block(&mut session, 8).context("read block 8")?;
    println!("block 8        {}", String::from_utf8_lossy(&block));
    Ok(())
}

fn cmd_recover(args: &[String]) -> Result<()> {
    let json = args.iter().any(|a| a == "--json");
    let values: Vec<&str> = args
        .iter()
        .map(String::as_str)
        .filter(|a| *a != "--json")
        .collect();
    if values.len() != 4 {
        bail!("usage: mfkit recover <uid> <known-nt> <enc-nt> <key> [--json]");
    }
    let uid = parse_u32(values[0]).context("uid")?;
    let known_nt = parse_u32(values[1]).context("known-nt")?;
    let encrypted_nt = parse_u32(values[2]).context("enc-nt")?;
    let known_key = parse_key(values[3]).context("key")?;

    let mut keys = recover_key_from_nonces(uid, known_nt, encrypted_nt, known_key);
    keys.sort_unstable();
    keys.dedup();
    tracing::info!(candidates = keys.len(), "recovery finished");

    if json {
        let hex: Vec<String> = keys.iter().map(|k| format!("{k:012x}")).collect();
        println!("{}", serde_json::to_string_pretty(&hex)?);
    } else {
        for key in keys {
            println!("{key:012x}");
        }
    }
    Ok(())
}

fn cmd_distance(args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("usage: mfkit distance <nt1> <nt2>");
    }
    let n1 = parse_u32(&args[0]).context("nt1")?;
    let n2 = parse_u32(&args[1]).context("nt2")?;
    match nonce_distance(n1, n2) {
        u32::MAX => println!("unreachable within 65536 steps"),
        distance => println!("{distance}"),
    }
    Ok(())
}

fn cmd_suc(args: &[String]) -> Result<()> {
    if args.len() != 2 {
        bail!("usage: mfkit suc <nonce> <steps>");
    }
    let nonce = parse_u32(&args[0]).context("nonce")?;
    let steps: u32 = args[1]
        .parse()
        .with_context(|| format!("invalid step count: {}", args[1]))?;
    println!("{:08x}", prng_successor(nonce, steps));
    Ok(())
}

fn cmd_crc(args: &[String]) -> Result<()> {
    if args.len() != 1 {
        bail!("usage: mfkit crc <hex-bytes>");
    }
    let mut frame = parse_hex_bytes(&args[0])?;
    let crc = auth::crc_a(&frame);
    frame.extend_from_slice(&crc);
    let hex: String = frame.iter().map(|b| format!("{b:02x}")).collect();
    println!("{hex}");
    Ok(())
}
