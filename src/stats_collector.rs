use std::time::{Duration, Instant};

use crate::util::formatted_size;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CollectionType {
    /// Marking started by the allocation heuristics or an explicit request.
    Major,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub enum MarkingType {
    Atomic,
    Incremental,
    IncrementalAndConcurrent,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(C)]
pub enum SweepingType {
    Atomic,
    IncrementalAndConcurrent,
}

/// Summary of a single garbage collection cycle.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub epoch: usize,
    pub collection_type: CollectionType,
    pub marking_type: MarkingType,
    pub sweeping_type: SweepingType,
    pub is_forced: bool,
    pub marked_bytes: usize,
    pub object_size_before_sweep: usize,
    pub memory_size_before_sweep: usize,
    pub swept_bytes: usize,
    pub objects_found_conservatively: usize,
    pub compacted_pages: usize,
    pub marking_time: Duration,
    pub atomic_pause_time: Duration,
    pub sweeping_time: Duration,
}

impl Event {
    fn new(epoch: usize, marking_type: MarkingType, sweeping_type: SweepingType) -> Self {
        Self {
            epoch,
            collection_type: CollectionType::Major,
            marking_type,
            sweeping_type,
            is_forced: false,
            marked_bytes: 0,
            object_size_before_sweep: 0,
            memory_size_before_sweep: 0,
            swept_bytes: 0,
            objects_found_conservatively: 0,
            compacted_pages: 0,
            marking_time: Duration::ZERO,
            atomic_pause_time: Duration::ZERO,
            sweeping_time: Duration::ZERO,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum GarbageCollectionState {
    NotRunning,
    Marking,
    Sweeping,
}

/// Tracks allocation volume between cycles and timing of the cycle phases.
///
/// The live object size is estimated as the marked bytes of the last cycle
/// plus everything allocated since, minus what was explicitly freed since.
pub struct StatsCollector {
    allocated_bytes_since_end_of_marking: isize,
    explicitly_freed_bytes_since_end_of_marking: usize,
    marked_bytes_so_far: usize,
    allocated_bytes_since_safepoint: usize,
    total_allocated_bytes: usize,
    total_allocated_objects: usize,
    total_explicitly_freed_bytes: usize,
    total_swept_bytes: usize,
    epoch: usize,
    state: GarbageCollectionState,
    current: Event,
    previous: Option<Event>,
    phase_start: Option<Instant>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            allocated_bytes_since_end_of_marking: 0,
            explicitly_freed_bytes_since_end_of_marking: 0,
            marked_bytes_so_far: 0,
            allocated_bytes_since_safepoint: 0,
            total_allocated_bytes: 0,
            total_allocated_objects: 0,
            total_explicitly_freed_bytes: 0,
            total_swept_bytes: 0,
            epoch: 0,
            state: GarbageCollectionState::NotRunning,
            current: Event::new(0, MarkingType::Atomic, SweepingType::Atomic),
            previous: None,
            phase_start: None,
        }
    }

    #[inline]
    pub fn notify_allocation(&mut self, bytes: usize) {
        self.allocated_bytes_since_end_of_marking += bytes as isize;
        self.allocated_bytes_since_safepoint += bytes;
        self.total_allocated_bytes += bytes;
        self.total_allocated_objects += 1;
    }

    pub fn notify_explicit_free(&mut self, bytes: usize) {
        self.explicitly_freed_bytes_since_end_of_marking += bytes;
        self.total_explicitly_freed_bytes += bytes;
    }

    /// Shrinking an object in place returns part of it.
    pub fn notify_shrink(&mut self, bytes: usize) {
        self.notify_explicit_free(bytes);
    }

    /// Growing an object in place adds to it.
    pub fn notify_grow(&mut self, bytes: usize) {
        self.allocated_bytes_since_end_of_marking += bytes as isize;
        self.total_allocated_bytes += bytes;
    }

    pub fn notify_marking_started(
        &mut self,
        marking_type: MarkingType,
        sweeping_type: SweepingType,
        is_forced: bool,
    ) {
        debug_assert_eq!(self.state, GarbageCollectionState::NotRunning);
        self.state = GarbageCollectionState::Marking;
        self.epoch += 1;
        self.current = Event::new(self.epoch, marking_type, sweeping_type);
        self.current.is_forced = is_forced;
        self.phase_start = Some(Instant::now());
    }

    pub fn notify_atomic_pause_started(&mut self) -> Instant {
        Instant::now()
    }

    pub fn notify_marking_completed(
        &mut self,
        marked_bytes: usize,
        objects_found_conservatively: usize,
        pause_start: Instant,
    ) {
        debug_assert_eq!(self.state, GarbageCollectionState::Marking);
        self.state = GarbageCollectionState::Sweeping;
        self.current.object_size_before_sweep = self.allocated_object_size();
        self.current.marked_bytes = marked_bytes;
        self.current.objects_found_conservatively = objects_found_conservatively;
        self.current.atomic_pause_time = pause_start.elapsed();
        if let Some(start) = self.phase_start.take() {
            self.current.marking_time = start.elapsed();
        }
        self.marked_bytes_so_far = marked_bytes;
        self.allocated_bytes_since_end_of_marking = 0;
        self.explicitly_freed_bytes_since_end_of_marking = 0;
        self.phase_start = Some(Instant::now());
    }

    pub fn notify_memory_before_sweep(&mut self, committed: usize) {
        self.current.memory_size_before_sweep = committed;
    }

    pub fn notify_compaction(&mut self, pages: usize) {
        self.current.compacted_pages = pages;
    }

    pub fn notify_swept(&mut self, bytes: usize) {
        self.current.swept_bytes += bytes;
        self.total_swept_bytes += bytes;
    }

    pub fn notify_sweeping_completed(&mut self) -> Event {
        debug_assert_eq!(self.state, GarbageCollectionState::Sweeping);
        self.state = GarbageCollectionState::NotRunning;
        if let Some(start) = self.phase_start.take() {
            self.current.sweeping_time = start.elapsed();
        }
        self.previous = Some(self.current);
        self.current
    }

    pub fn notify_safepoint(&mut self) {
        self.allocated_bytes_since_safepoint = 0;
    }

    pub fn is_marking(&self) -> bool {
        self.state == GarbageCollectionState::Marking
    }

    pub fn is_sweeping(&self) -> bool {
        self.state == GarbageCollectionState::Sweeping
    }

    /// Estimated size of all objects, free memory excluded.
    pub fn allocated_object_size(&self) -> usize {
        let size = self.marked_bytes_so_far as isize + self.allocated_bytes_since_end_of_marking
            - self.explicitly_freed_bytes_since_end_of_marking as isize;
        size.max(0) as usize
    }

    pub fn allocated_bytes_since_end_of_marking(&self) -> isize {
        self.allocated_bytes_since_end_of_marking
    }

    pub fn allocated_bytes_since_safepoint(&self) -> usize {
        self.allocated_bytes_since_safepoint
    }

    pub fn marked_bytes(&self) -> usize {
        self.marked_bytes_so_far
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn previous_event(&self) -> Option<&Event> {
        self.previous.as_ref()
    }

    pub fn total_allocated_bytes(&self) -> usize {
        self.total_allocated_bytes
    }

    pub fn total_allocated_objects(&self) -> usize {
        self.total_allocated_objects
    }

    pub fn total_explicitly_freed_bytes(&self) -> usize {
        self.total_explicitly_freed_bytes
    }

    pub fn total_swept_bytes(&self) -> usize {
        self.total_swept_bytes
    }
}

/// Point-in-time view of the heap, see [`Heap::statistics`](crate::heap::Heap::statistics).
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapStatistics {
    pub committed_memory: usize,
    pub reserved_memory: usize,
    pub allocated_object_size: usize,
    pub free_list_size: usize,
    pub normal_pages: usize,
    pub large_pages: usize,
    pub total_gc_cycles_count: usize,
    pub total_allocated_bytes: usize,
    pub total_allocated_objects: usize,
    pub total_explicitly_freed_bytes: usize,
    pub total_swept_bytes: usize,
    pub last_marked_bytes: usize,
    pub last_objects_found_conservatively: usize,
    pub heap_limit: usize,
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Committed page memory: {} of {} reserved",
            formatted_size(self.committed_memory),
            formatted_size(self.reserved_memory)
        )?;
        writeln!(
            f,
            "  Pages: {} normal, {} large",
            self.normal_pages, self.large_pages
        )?;
        writeln!(
            f,
            "  Allocated object size: {}",
            formatted_size(self.allocated_object_size)
        )?;
        writeln!(f, "  Free list size: {}", formatted_size(self.free_list_size))?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Total memory allocated: {}",
            formatted_size(self.total_allocated_bytes)
        )?;
        writeln!(
            f,
            "  Total objects allocated: {}",
            self.total_allocated_objects
        )?;
        writeln!(
            f,
            "  Total memory freed explicitly: {}",
            formatted_size(self.total_explicitly_freed_bytes)
        )?;
        writeln!(
            f,
            "  Total memory swept: {}",
            formatted_size(self.total_swept_bytes)
        )?;
        writeln!(
            f,
            "  Marked in last cycle: {} ({} objects found conservatively)",
            formatted_size(self.last_marked_bytes),
            self.last_objects_found_conservatively
        )?;
        writeln!(f, "  Heap limit: {}", formatted_size(self.heap_limit))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_object_size_tracks_cycle() {
        let mut stats = StatsCollector::new();
        stats.notify_allocation(64);
        stats.notify_allocation(32);
        stats.notify_explicit_free(32);
        assert_eq!(stats.allocated_object_size(), 64);

        stats.notify_marking_started(MarkingType::Atomic, SweepingType::Atomic, true);
        assert!(stats.is_marking());
        let pause = stats.notify_atomic_pause_started();
        stats.notify_marking_completed(48, 0, pause);
        assert!(stats.is_sweeping());
        assert_eq!(stats.allocated_object_size(), 48);
        stats.notify_swept(16);
        let event = stats.notify_sweeping_completed();
        assert_eq!(event.epoch, 1);
        assert_eq!(event.marked_bytes, 48);
        assert_eq!(event.object_size_before_sweep, 64);
        assert_eq!(event.swept_bytes, 16);
        assert!(event.is_forced);
        assert_eq!(stats.previous_event().map(|event| event.epoch), Some(1));
    }

    #[test]
    fn test_statistics_display() {
        let statistics = HeapStatistics {
            committed_memory: 2 * 1024 * 1024,
            total_gc_cycles_count: 3,
            ..Default::default()
        };
        let text = statistics.to_string();
        assert!(text.contains("Total GC cycles count: 3"));
        assert!(text.contains("2.0M"));
    }
}
