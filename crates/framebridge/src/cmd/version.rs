use crate::cmd::envinfo::target_triple;
use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use framebridge_protocol::{PROTOCOL_MAGIC, PROTOCOL_VERSION};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("framebridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: framebridge");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol: {PROTOCOL_MAGIC} v{PROTOCOL_VERSION}");
    println!("target: {}", target_triple());
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("features: {}", active_features().join(", "));

    Ok(SUCCESS)
}

pub(crate) fn active_features() -> Vec<&'static str> {
    let mut features = Vec::new();
    if cfg!(feature = "client") {
        features.push("client");
    }
    if cfg!(feature = "lz4") {
        features.push("lz4");
    }
    if cfg!(feature = "rmp") {
        features.push("rmp");
    }
    if cfg!(feature = "async") {
        features.push("async");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    features
}
