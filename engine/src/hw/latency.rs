/// Input and output latency in frames as `((min, max), (min, max))`.
///
/// The output maximum includes both ring halves queued ahead of the hardware.
pub fn latency_ranges(
    buffer_frames: usize,
    input_latency_frames: usize,
    output_latency_frames: usize,
) -> ((usize, usize), (usize, usize)) {
    let input = input_latency_frames;
    let min_output = output_latency_frames;
    let max_output = output_latency_frames + 2 * buffer_frames;
    ((input, input), (min_output, max_output))
}
