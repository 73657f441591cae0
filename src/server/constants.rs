pub const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;
