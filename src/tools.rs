//! Utility routines for collective data movement.
//!
//! Every varcount operation here follows the same pattern: share the
//! per-rank block counts, derive the block displacements, size a
//! default-initialized receive buffer, and hand MPI a partition view of
//! it.

use mpi::{
    collective::SystemOperation,
    datatype::{Partition, PartitionMut},
    traits::{CommunicatorCollectives, Equivalence, Root},
};

/// The displacement of each block given the block counts: the exclusive
/// prefix sum, e.g. counts `[3, 4, 5]` give `[0, 3, 7]`.
pub fn displacements(counts: &[i32]) -> Vec<i32> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut offset = 0;
    for &c in counts {
        displs.push(offset);
        offset += c;
    }
    displs
}

/// Gather an array to all processes.
pub fn gather_to_all<T: Equivalence + Default + Copy, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Vec<T> {
    let nproc = comm.size() as usize;

    // Share the per-rank lengths first, then move the payload with a
    // varcount gather.
    let local_count = arr.len() as i32;
    let mut counts = vec![0_i32; nproc];
    comm.all_gather_into(&local_count, &mut counts);

    let displs = displacements(&counts);
    let total = counts.iter().sum::<i32>() as usize;

    let mut gathered = vec![T::default(); total];
    let mut partition = PartitionMut::new(&mut gathered[..], counts, &displs[..]);
    comm.all_gather_varcount_into(arr, &mut partition);

    gathered
}

/// Gather a distributed array to the root rank.
///
/// The result is a `Vec<T>` on root and `None` on all other ranks.
pub fn gather_to_root<T: Equivalence + Default + Copy, C: CommunicatorCollectives>(
    arr: &[T],
    comm: &C,
) -> Option<Vec<T>> {
    let local_count = arr.len() as i32;
    let root = comm.process_at_rank(0);

    if comm.rank() != 0 {
        root.gather_into(&local_count);
        root.gather_varcount_into(arr);
        return None;
    }

    let mut counts = vec![0_i32; comm.size() as usize];
    root.gather_into_root(&local_count, &mut counts);

    let displs = displacements(&counts);
    let total = counts.iter().sum::<i32>() as usize;

    let mut gathered = vec![T::default(); total];
    let mut partition = PartitionMut::new(&mut gathered[..], counts, &displs[..]);
    root.gather_varcount_into_root(arr, &mut partition);

    Some(gathered)
}

/// The summed length of a distributed array.
pub fn global_size<T, C: CommunicatorCollectives>(arr: &[T], comm: &C) -> usize {
    let local = arr.len();
    let mut global = 0;
    comm.all_reduce_into(&local, &mut global, SystemOperation::sum());
    global
}

/// Exclusive prefix sum of `value` over the ranks. Rank 0 receives 0.
pub fn global_exclusive_sum<C: CommunicatorCollectives>(value: usize, comm: &C) -> usize {
    let mut result = 0;
    comm.exclusive_scan_into(&value, &mut result, SystemOperation::sum());
    if comm.rank() == 0 {
        result = 0;
    }
    result
}

/// Redistribute an array via all-to-allv, sending `counts[r]` consecutive
/// elements to rank `r`.
pub fn redistribute<T: Equivalence + Default + Copy, C: CommunicatorCollectives>(
    arr: &[T],
    counts: &[i32],
    comm: &C,
) -> Vec<T> {
    debug_assert_eq!(counts.len(), comm.size() as usize);
    debug_assert_eq!(counts.iter().sum::<i32>() as usize, arr.len());

    // First communicate how many elements everybody gets from each process.

    let mut counts_from_processor = vec![0_i32; counts.len()];
    comm.all_to_all_into(counts, &mut counts_from_processor);

    // Each process now knows how much it gets from all the others. Send
    // the actual elements with an all-to-allv.

    let send_displs = displacements(counts);
    let send_partition = Partition::new(arr, counts, &send_displs[..]);

    let mut recvbuffer = vec![T::default(); counts_from_processor.iter().sum::<i32>() as usize];
    let recv_displs = displacements(&counts_from_processor);

    let mut receiv_partition =
        PartitionMut::new(&mut recvbuffer[..], counts_from_processor, &recv_displs[..]);
    comm.all_to_all_varcount_into(&send_partition, &mut receiv_partition);

    recvbuffer
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_displacements() {
        assert_eq!(displacements(&[3, 4, 5]), vec![0, 3, 7]);
        assert_eq!(displacements(&[]), Vec::<i32>::new());
    }
}
