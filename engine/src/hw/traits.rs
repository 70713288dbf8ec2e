/// Driver-independent view of an audio device.
pub trait HwDevice {
    fn input_channels(&self) -> usize;
    fn output_channels(&self) -> usize;
    fn sample_rate(&self) -> i32;
    fn latency_ranges(&self) -> ((usize, usize), (usize, usize));
}

#[macro_export]
macro_rules! impl_hw_device_for_driver {
    ($driver:ty) => {
        impl $crate::hw::traits::HwDevice for $driver {
            fn input_channels(&self) -> usize {
                self.input_channel_count().unwrap_or(0)
            }

            fn output_channels(&self) -> usize {
                self.output_channel_count().unwrap_or(0)
            }

            fn sample_rate(&self) -> i32 {
                self.sample_rate().map(|rate| rate as i32).unwrap_or(0)
            }

            fn latency_ranges(&self) -> ((usize, usize), (usize, usize)) {
                self.latency_ranges()
            }
        }
    };
}
