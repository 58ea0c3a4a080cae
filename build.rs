//! Build script for nitro-media
//!
//! This script handles:
//! - FFmpeg library detection when the `ffmpeg` feature is enabled
//! - ALSA detection when the `cpal` feature is enabled on Linux
//!
//! Linking itself is left to `ffmpeg-sys-next` and `cpal`; this script only
//! reports missing system libraries early with install hints.

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    if env::var_os("CARGO_FEATURE_FFMPEG").is_some() {
        if let Err(e) = check_ffmpeg() {
            println!("cargo:warning=FFmpeg check failed: {}", e);
            print_ffmpeg_hints(&target_os);
        }
    }

    if env::var_os("CARGO_FEATURE_CPAL").is_some() && target_os == "linux" {
        if pkg_config::probe_library("alsa").is_err() {
            println!("cargo:warning=ALSA development files not found (libasound2-dev / alsa-lib-devel)");
        }
    }
}

/// Check that the FFmpeg libraries used by the demuxer and decoders are present
fn check_ffmpeg() -> Result<(), String> {
    // An explicit FFMPEG_DIR is handed straight to ffmpeg-sys-next
    if env::var_os("FFMPEG_DIR").is_some() {
        return Ok(());
    }

    for lib in ["libavcodec", "libavformat", "libavutil", "libswscale", "libswresample"] {
        pkg_config::probe_library(lib).map_err(|e| format!("{}: {}", lib, e))?;
    }

    Ok(())
}

fn print_ffmpeg_hints(target_os: &str) {
    match target_os {
        "windows" => {
            println!("cargo:warning=  Download a shared build and set FFMPEG_DIR to its root");
        }
        "macos" => {
            println!("cargo:warning=  Run: brew install ffmpeg");
        }
        "linux" => {
            println!("cargo:warning=  Ubuntu/Debian: sudo apt install libavcodec-dev libavformat-dev libavutil-dev libswscale-dev libswresample-dev");
            println!("cargo:warning=  Fedora: sudo dnf install ffmpeg-devel");
            println!("cargo:warning=  Arch: sudo pacman -S ffmpeg");
        }
        _ => {}
    }
}
