pub mod access_mode;
pub mod finalize_trait;
pub mod gc_info;
pub mod marking_bitmap;
pub mod object_start_bitmap;
pub mod trace_trait;
pub mod worklist;
