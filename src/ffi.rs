//! C ABI for the native bridge.
//!
//! Two opaque handles cross the boundary:
//!   - `VoiceChain*`, owned by the audio callback (create, start, stop,
//!     process, destroy);
//!   - `ChainController*`, used from any other thread for parameters,
//!     lifecycle requests and telemetry.
//!
//! Null handles are ignored. Every entry point catches panics so none unwinds
//! into the caller.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

use crate::chain::{BlockOutcome, ChainController, VoiceChain};
use crate::config::ChainConfig;
use crate::meters::TelemetrySnapshot;
use crate::params::{
    AgcParams, BandOrder, CompressorParams, LimiterParams, NoiseCancellerParams, Stage,
};

pub const VOX_PROCESSED: i32 = 0;
pub const VOX_SILENCED: i32 = 1;
pub const VOX_STOPPED: i32 = 2;
pub const VOX_REJECTED: i32 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VoxTelemetry {
    pub peak_db: f32,
    pub rms_db: f32,
    pub agc_current_gain_db: f32,
    pub agc_current_level_db: f32,
    pub compressor_gain_reduction_db: f32,
    pub limiter_gain_reduction_db: f32,
    pub noise_floor_db: f32,
    pub cpu_usage_percent: f32,
    pub latency_input_ms: f32,
    pub latency_output_ms: f32,
    pub latency_total_ms: f32,
    pub latency_ema_ms: f32,
    pub latency_min_ms: f32,
    pub latency_max_ms: f32,
    pub xrun_count: u64,
    pub callback_size_frames: u32,
    pub running: u32,
    pub non_finite_block_count: u64,
    pub sanitized_param_count: u64,
    pub noise_canceller_cpu_ms: f32,
    pub processing_latency_ms: f32,
    pub stage_memory_bytes: u64,
}

impl From<&TelemetrySnapshot> for VoxTelemetry {
    fn from(t: &TelemetrySnapshot) -> Self {
        Self {
            peak_db: t.peak_db,
            rms_db: t.rms_db,
            agc_current_gain_db: t.agc_current_gain_db,
            agc_current_level_db: t.agc_current_level_db,
            compressor_gain_reduction_db: t.compressor_gain_reduction_db,
            limiter_gain_reduction_db: t.limiter_gain_reduction_db,
            noise_floor_db: t.noise_floor_db,
            cpu_usage_percent: t.cpu_usage_percent,
            latency_input_ms: t.latency_input_ms,
            latency_output_ms: t.latency_output_ms,
            latency_total_ms: t.latency_total_ms,
            latency_ema_ms: t.latency_ema_ms,
            latency_min_ms: t.latency_min_ms,
            latency_max_ms: t.latency_max_ms,
            xrun_count: t.xrun_count,
            callback_size_frames: t.callback_size_frames,
            running: t.running as u32,
            non_finite_block_count: t.non_finite_block_count,
            sanitized_param_count: t.sanitized_param_count,
            noise_canceller_cpu_ms: t.noise_canceller_cpu_ms,
            processing_latency_ms: t.processing_latency_ms,
            stage_memory_bytes: t.stage_memory_bytes,
        }
    }
}

fn guarded<R>(fallback: R, f: impl FnOnce() -> R) -> R {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(fallback)
}

/// Run `f` against a live controller; `fallback` on null or panic.
unsafe fn with_controller<R>(
    ctl: *const ChainController,
    fallback: R,
    f: impl FnOnce(&ChainController) -> R,
) -> R {
    match ctl.as_ref() {
        Some(c) => guarded(fallback, || f(c)),
        None => fallback,
    }
}

// --- Audio-side handle -------------------------------------------------------

/// Create a stopped chain with default parameters. Returns null when the
/// configuration is invalid.
#[no_mangle]
pub extern "C" fn voxchain_create(
    sample_rate: f32,
    channels: u32,
    max_block_frames: u32,
) -> *mut VoiceChain {
    guarded(ptr::null_mut(), || {
        let config = ChainConfig {
            sample_rate,
            channels: channels as usize,
            max_block_frames: max_block_frames as usize,
            ..ChainConfig::default()
        };
        match VoiceChain::new(config) {
            Ok((chain, _)) => Box::into_raw(Box::new(chain)),
            Err(e) => {
                log::error!("voxchain_create: {:#}", e);
                ptr::null_mut()
            }
        }
    })
}

/// # Safety
/// `chain` must come from `voxchain_create` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn voxchain_destroy(chain: *mut VoiceChain) {
    if !chain.is_null() {
        guarded((), || drop(Box::from_raw(chain)));
    }
}

/// # Safety
/// `chain` must be a live handle not used concurrently from another thread.
#[no_mangle]
pub unsafe extern "C" fn voxchain_start(chain: *mut VoiceChain) {
    if let Some(chain) = chain.as_mut() {
        guarded((), || chain.start());
    }
}

/// # Safety
/// Same as [`voxchain_start`].
#[no_mangle]
pub unsafe extern "C" fn voxchain_stop(chain: *mut VoiceChain) {
    if let Some(chain) = chain.as_mut() {
        guarded((), || chain.stop());
    }
}

/// Process `len` interleaved samples in place. Returns one of the
/// `VOX_*` outcome codes.
///
/// # Safety
/// `chain` must be a live handle owned by the calling thread and `samples`
/// must point to `len` writable floats.
#[no_mangle]
pub unsafe extern "C" fn voxchain_process(
    chain: *mut VoiceChain,
    samples: *mut f32,
    len: usize,
) -> i32 {
    let Some(chain) = chain.as_mut() else {
        return VOX_REJECTED;
    };
    if samples.is_null() {
        return VOX_REJECTED;
    }
    let block = std::slice::from_raw_parts_mut(samples, len);
    guarded(VOX_REJECTED, || match chain.process_block(block) {
        BlockOutcome::Processed => VOX_PROCESSED,
        BlockOutcome::Silenced => VOX_SILENCED,
        BlockOutcome::Stopped => VOX_STOPPED,
        BlockOutcome::Rejected => VOX_REJECTED,
    })
}

/// Create a control handle for `chain`. Free it with
/// `voxchain_controller_free`; it stays valid after the chain is destroyed.
///
/// # Safety
/// `chain` must be a live handle.
#[no_mangle]
pub unsafe extern "C" fn voxchain_controller_new(chain: *const VoiceChain) -> *mut ChainController {
    match chain.as_ref() {
        Some(chain) => guarded(ptr::null_mut(), || Box::into_raw(Box::new(chain.controller()))),
        None => ptr::null_mut(),
    }
}

/// # Safety
/// `ctl` must come from `voxchain_controller_new` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn voxchain_controller_free(ctl: *mut ChainController) {
    if !ctl.is_null() {
        guarded((), || drop(Box::from_raw(ctl)));
    }
}

// --- Control-side handle -----------------------------------------------------
//
// Safety for everything below: `ctl` is null or a live controller handle.

#[no_mangle]
pub unsafe extern "C" fn voxchain_request_start(ctl: *const ChainController) {
    with_controller(ctl, (), |c| c.request_start());
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_request_stop(ctl: *const ChainController) {
    with_controller(ctl, (), |c| c.request_stop());
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_is_running(ctl: *const ChainController) -> bool {
    with_controller(ctl, false, |c| c.is_running())
}

#[allow(clippy::too_many_arguments)]
#[no_mangle]
pub unsafe extern "C" fn voxchain_set_agc(
    ctl: *const ChainController,
    enabled: bool,
    target_level_db: f32,
    max_gain_db: f32,
    min_gain_db: f32,
    attack_time_s: f32,
    release_time_s: f32,
    noise_threshold_db: f32,
    window_size_s: f32,
) {
    with_controller(ctl, (), |c| {
        c.set_agc_params(AgcParams {
            enabled,
            target_level_db,
            max_gain_db,
            min_gain_db,
            attack_time_s,
            release_time_s,
            noise_threshold_db,
            window_size_s,
        });
    });
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_set_agc_max_gain_db(ctl: *const ChainController, db: f32) -> f32 {
    with_controller(ctl, db, |c| c.set_agc_max_gain_db(db))
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_set_agc_min_gain_db(ctl: *const ChainController, db: f32) -> f32 {
    with_controller(ctl, db, |c| c.set_agc_min_gain_db(db))
}

/// `gains` may hold any number of entries; missing bands are 0 dB and
/// extras are ignored.
#[no_mangle]
pub unsafe extern "C" fn voxchain_set_eq_bands(
    ctl: *const ChainController,
    gains: *const f32,
    len: usize,
) {
    let gains = if gains.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(gains, len)
    };
    with_controller(ctl, (), |c| {
        c.set_eq_bands(gains);
    });
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_set_eq_band_gain(
    ctl: *const ChainController,
    index: u32,
    db: f32,
) -> bool {
    with_controller(ctl, false, |c| c.set_eq_band_gain(index as usize, db))
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_set_eq_precalc(ctl: *const ChainController, precalc: bool) {
    with_controller(ctl, (), |c| c.set_eq_precalc(precalc));
}

/// Unknown order indices are ignored and return `false`.
#[no_mangle]
pub unsafe extern "C" fn voxchain_set_eq_band_order(
    ctl: *const ChainController,
    order: u32,
) -> bool {
    let Some(order) = BandOrder::from_index(order) else {
        return false;
    };
    with_controller(ctl, false, |c| {
        c.set_eq_band_order(order);
        true
    })
}

#[allow(clippy::too_many_arguments)]
#[no_mangle]
pub unsafe extern "C" fn voxchain_set_noise_canceller(
    ctl: *const ChainController,
    enabled: bool,
    strength: f32,
    spectral_floor_db: f32,
    smoothing: f32,
    noise_attack_ms: f32,
    noise_release_ms: f32,
    residual_boost_db: f32,
    artifact_suppress: f32,
) {
    with_controller(ctl, (), |c| {
        let current = c.params().noise_canceller;
        c.set_noise_canceller_params(NoiseCancellerParams {
            enabled,
            strength,
            spectral_floor_db,
            smoothing,
            noise_attack_ms,
            noise_release_ms,
            residual_boost_db,
            artifact_suppress,
            preset_id: current.preset_id,
        });
    });
}

/// Apply a noise preset by index; an unknown index changes nothing.
#[no_mangle]
pub unsafe extern "C" fn voxchain_apply_noise_preset(
    ctl: *const ChainController,
    index: i32,
) -> bool {
    with_controller(ctl, false, |c| c.apply_noise_preset_index(index))
}

#[allow(clippy::too_many_arguments)]
#[no_mangle]
pub unsafe extern "C" fn voxchain_set_compressor(
    ctl: *const ChainController,
    enabled: bool,
    threshold_db: f32,
    ratio: f32,
    attack_ms: f32,
    release_ms: f32,
    knee_db: f32,
    makeup_gain_db: f32,
) {
    with_controller(ctl, (), |c| {
        c.set_compressor_params(CompressorParams {
            enabled,
            threshold_db,
            ratio,
            attack_ms,
            release_ms,
            knee_db,
            makeup_gain_db,
        });
    });
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_set_limiter(
    ctl: *const ChainController,
    enabled: bool,
    threshold_db: f32,
    release_ms: f32,
    lookahead_ms: f32,
) {
    with_controller(ctl, (), |c| {
        c.set_limiter_params(LimiterParams {
            enabled,
            threshold_db,
            release_ms,
            lookahead_ms,
        });
    });
}

/// Returns the stored (clamped) gain.
#[no_mangle]
pub unsafe extern "C" fn voxchain_set_voice_gain_db(ctl: *const ChainController, db: f32) -> f32 {
    with_controller(ctl, 0.0, |c| c.set_voice_gain_db(db))
}

/// Stage indices: 0 AGC, 1 EQ, 2 noise canceller, 3 compressor, 4 limiter.
#[no_mangle]
pub unsafe extern "C" fn voxchain_set_stage_enabled(
    ctl: *const ChainController,
    stage: i32,
    enabled: bool,
) -> bool {
    let Some(stage) = Stage::from_index(stage) else {
        return false;
    };
    with_controller(ctl, false, |c| {
        c.set_stage_enabled(stage, enabled);
        true
    })
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_report_xrun(ctl: *const ChainController) {
    with_controller(ctl, (), |c| c.report_xrun());
}

#[no_mangle]
pub unsafe extern "C" fn voxchain_set_io_latency_ms(
    ctl: *const ChainController,
    input_ms: f32,
    output_ms: f32,
) {
    with_controller(ctl, (), |c| c.set_io_latency_ms(input_ms, output_ms));
}

/// Copy the latest telemetry into `out`. Returns `false` on null arguments.
#[no_mangle]
pub unsafe extern "C" fn voxchain_get_telemetry(
    ctl: *const ChainController,
    out: *mut VoxTelemetry,
) -> bool {
    let Some(out) = out.as_mut() else {
        return false;
    };
    with_controller(ctl, false, |c| {
        *out = VoxTelemetry::from(&c.telemetry());
        true
    })
}

/// Forward queued audio-thread diagnostics to the installed logger.
#[no_mangle]
pub unsafe extern "C" fn voxchain_drain_diagnostics(ctl: *const ChainController) -> u32 {
    with_controller(ctl, 0, |c| c.drain_diagnostics() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_returns_null() {
        assert!(voxchain_create(48000.0, 0, 256).is_null());
        assert!(voxchain_create(f32::NAN, 1, 256).is_null());
    }

    #[test]
    fn test_null_handles_are_ignored() {
        unsafe {
            voxchain_start(ptr::null_mut());
            voxchain_stop(ptr::null_mut());
            voxchain_destroy(ptr::null_mut());
            voxchain_controller_free(ptr::null_mut());
            voxchain_report_xrun(ptr::null());
            assert_eq!(voxchain_process(ptr::null_mut(), ptr::null_mut(), 0), VOX_REJECTED);
            assert!(!voxchain_set_stage_enabled(ptr::null(), 0, true));
            let mut t = VoxTelemetry::default();
            assert!(!voxchain_get_telemetry(ptr::null(), &mut t));
        }
    }

    #[test]
    fn test_null_controller_setters_return_fallbacks() {
        let ctl: *const ChainController = ptr::null();
        unsafe {
            voxchain_request_start(ctl);
            voxchain_request_stop(ctl);
            assert!(!voxchain_is_running(ctl));
            voxchain_set_agc(ctl, true, -18.0, 12.0, -12.0, 0.1, 0.5, -50.0, 0.4);
            assert_eq!(voxchain_set_agc_max_gain_db(ctl, 40.0), 40.0);
            assert_eq!(voxchain_set_agc_min_gain_db(ctl, -40.0), -40.0);
            voxchain_set_eq_bands(ctl, ptr::null(), 4);
            assert!(!voxchain_set_eq_band_gain(ctl, 0, 3.0));
            voxchain_set_eq_precalc(ctl, true);
            assert!(!voxchain_set_eq_band_order(ctl, 1));
            voxchain_set_noise_canceller(ctl, true, 0.5, -60.0, 0.6, 20.0, 400.0, 0.0, 0.5);
            assert!(!voxchain_apply_noise_preset(ctl, 1));
            voxchain_set_compressor(ctl, true, -20.0, 4.0, 10.0, 100.0, 6.0, 0.0);
            voxchain_set_limiter(ctl, true, -1.0, 50.0, 5.0);
            assert_eq!(voxchain_set_voice_gain_db(ctl, 6.0), 0.0);
            voxchain_set_io_latency_ms(ctl, 5.0, 5.0);
            assert_eq!(voxchain_drain_diagnostics(ctl), 0);
            assert!(voxchain_controller_new(ptr::null()).is_null());
        }
    }

    #[test]
    fn test_panics_stop_at_the_boundary() {
        let (_chain, ctl) = VoiceChain::new(ChainConfig::default()).unwrap();
        let out = unsafe { with_controller(&ctl, -1, |_| -> i32 { panic!("boom") }) };
        assert_eq!(out, -1);
        assert_eq!(guarded(VOX_REJECTED, || -> i32 { panic!("boom") }), VOX_REJECTED);

        // The controller is still usable afterwards
        let got = unsafe { with_controller(&ctl, 0.0, |c| c.set_voice_gain_db(-3.0)) };
        assert_eq!(got, -3.0);
    }

    #[test]
    fn test_controller_setters_reach_the_store() {
        unsafe {
            let chain = voxchain_create(48000.0, 1, 256);
            let ctl = voxchain_controller_new(chain);
            assert!(!ctl.is_null());

            voxchain_set_agc(ctl, true, -20.0, 12.0, -6.0, 0.05, 0.5, -50.0, 0.4);
            assert_eq!(voxchain_set_agc_max_gain_db(ctl, 50.0), 40.0);
            voxchain_set_eq_precalc(ctl, true);
            assert!(voxchain_set_eq_band_gain(ctl, 4, 30.0));
            voxchain_set_noise_canceller(ctl, true, 0.7, -60.0, 0.6, 20.0, 400.0, 0.0, 0.5);
            voxchain_set_compressor(ctl, true, -24.0, 3.0, 10.0, 120.0, 6.0, 2.0);
            voxchain_set_limiter(ctl, true, -2.0, 60.0, 5.0);

            let p = (*ctl).params();
            assert!(p.agc.enabled);
            assert_eq!(p.agc.target_level_db, -20.0);
            assert!(p.equalizer.precalc_coefficients);
            assert_eq!(p.equalizer.band_gains_db[4], 12.0);
            assert_eq!(p.noise_canceller.strength, 0.7);
            assert_eq!(p.compressor.ratio, 3.0);
            assert_eq!(p.limiter.threshold_db, -2.0);

            voxchain_request_start(ctl);
            let mut block = vec![0.1f32; 256];
            assert_eq!(voxchain_process(chain, block.as_mut_ptr(), block.len()), VOX_PROCESSED);
            assert!(voxchain_is_running(ctl));
            voxchain_request_stop(ctl);
            assert_eq!(voxchain_process(chain, block.as_mut_ptr(), block.len()), VOX_STOPPED);

            voxchain_controller_free(ctl);
            voxchain_destroy(chain);
        }
    }

    #[test]
    fn test_bridge_round_trip() {
        unsafe {
            let chain = voxchain_create(48000.0, 2, 256);
            assert!(!chain.is_null());
            let ctl = voxchain_controller_new(chain);

            assert_eq!(voxchain_set_voice_gain_db(ctl, 20.0), 12.0);
            assert!(voxchain_apply_noise_preset(ctl, 2));
            assert!(!voxchain_apply_noise_preset(ctl, 9));
            assert!(!voxchain_set_stage_enabled(ctl, 7, true));
            assert!(voxchain_set_eq_band_order(ctl, 3));
            assert!(!voxchain_set_eq_band_order(ctl, 4));
            let gains = [3.0f32, -3.0];
            voxchain_set_eq_bands(ctl, gains.as_ptr(), gains.len());

            let mut block = vec![0.25f32; 512];
            assert_eq!(voxchain_process(chain, block.as_mut_ptr(), block.len()), VOX_STOPPED);

            voxchain_start(chain);
            assert!(voxchain_is_running(ctl));
            assert_eq!(voxchain_process(chain, block.as_mut_ptr(), block.len()), VOX_PROCESSED);

            let mut t = VoxTelemetry::default();
            assert!(voxchain_get_telemetry(ctl, &mut t));
            assert_eq!(t.callback_size_frames, 256);
            assert_eq!(t.running, 1);

            voxchain_stop(chain);
            voxchain_destroy(chain);
            // The controller outlives the chain
            assert!(!voxchain_is_running(ctl));
            voxchain_controller_free(ctl);
        }
    }
}
