/// Test if `ptr` is aligned to a multiple of `align`
pub fn aligned_to<T>(ptr: *const T, align: usize) -> bool {
    ptr as usize % align == 0
}
