/// A device buffer object that can back a run of guest memory blocks.
///
/// Implemented by the graphics backend. The surface cache never creates buffers itself; it only
/// asks the backend to merge existing ones.
pub trait BufferObject: Sized {
    /// Whatever the backend needs to record copies (command list, device handle, ...).
    type Context;

    /// Size in bytes.
    fn size(&self) -> u64;

    /// Guest address of the first byte.
    fn base_address(&self) -> u32;

    /// Build one buffer covering the concatenation of `list`, starting at `base_address`.
    ///
    /// Entry `i` of `list` is either an existing buffer (whose contents must be preserved at its
    /// offset) or `None` for a single unbacked block of `block_size` bytes. The result must be
    /// exactly as large as the sum of those sizes.
    fn merge_bo_list(
        ctx: &mut Self::Context,
        block_size: u32,
        base_address: u32,
        list: Vec<Option<Self>>,
    ) -> Self;

    /// Move the contents to host memory and release device memory.
    fn spill_buffer(&mut self, ctx: &mut Self::Context);

    /// Restore the contents of a spilled buffer to device memory.
    fn unspill_buffer(&mut self, ctx: &mut Self::Context);
}
