//! Input hooks consumed by the preprocessing stage that expands button and
//! axis uniforms.

/// One sampled input reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputSample {
    pub value: f32,
    pub button_held: bool,
    pub touch_held: bool,
}

/// Source of button and axis readings, keyed by device and input id.
pub trait InputSource {
    fn sample_button(&self, device: u32, input_id: u32) -> InputSample;
    fn sample_axis(&self, device: u32, input_id: u32) -> InputSample;
}

/// Reports every input as idle.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInput;

impl InputSource for NoInput {
    fn sample_button(&self, _device: u32, _input_id: u32) -> InputSample {
        InputSample::default()
    }

    fn sample_axis(&self, _device: u32, _input_id: u32) -> InputSample {
        InputSample::default()
    }
}
