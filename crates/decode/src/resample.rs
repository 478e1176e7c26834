use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

/// Resample planar audio to `target_sample_rate` with sinc interpolation.
///
/// Returns a copy of the input when the rates already match. Not real-time
/// safe: allocates the resampler and all output buffers.
pub fn resample_planes(
    planes: &[Vec<f32>],
    sample_rate: u32,
    target_sample_rate: u32,
) -> anyhow::Result<Vec<Vec<f32>>> {
    let input_frames = planes.first().map_or(0, Vec::len);
    if sample_rate == target_sample_rate || input_frames == 0 {
        return Ok(planes.to_vec());
    }

    let resample_ratio = target_sample_rate as f64 / sample_rate as f64;

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler =
        SincFixedIn::<f32>::new(resample_ratio, 2.0, params, input_frames, planes.len())?;

    Ok(resampler.process(planes, None)?)
}
