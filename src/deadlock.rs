//! Wait-for-graph scan.
//!
//! A thread waits on at most one of three things, giving it outgoing
//! edges:
//!
//! - joining: one edge to the thread being joined;
//! - a mutex: one edge to the owner (none if the mutex is ownerless);
//! - a condition variable: edges to **every** not-finished thread that is
//!   not itself waiting on the same variable. Any such thread could still
//!   signal, so a condition wait only participates in a deadlock once no
//!   possible signaler remains — at which point those edges close among
//!   the blocked threads with no way out.
//!
//! The scan is an iterative depth-first search from every not-finished
//! thread, stamping visited records with a per-invocation generation.
//! A cycle is reported when an edge lands on a thread still on the current
//! DFS path. Each traversal reports a cycle at most once; repeats across
//! invocations are expected and harmless.

use crate::sched::SchedState;
use crate::Id;

/// Scan the wait-for graph and return every discovered cycle as the list
/// of thread ids along it. Runs inside the scheduler's protected zone; the
/// working set is bounded by the thread count.
pub(crate) fn scan(state: &mut SchedState) -> Vec<Vec<Id>> {
    state.scan_generation = state.scan_generation.wrapping_add(1);
    let generation = state.scan_generation;
    let roots: Vec<Id> = state.not_finished.clone();
    let mut cycles = Vec::new();

    for root in roots {
        if state.tcb(root).map(|t| t.explore_mark) == Some(generation) {
            continue;
        }
        explore(state, root, generation, &mut cycles);
    }
    cycles
}

/// One DFS traversal. `path` mirrors the chain of threads the search is
/// currently inside; membership is checked by a linear scan, which keeps
/// the scratch per thread down to the single generation stamp.
fn explore(state: &mut SchedState, root: Id, generation: u32, cycles: &mut Vec<Vec<Id>>) {
    let mut path: Vec<Id> = Vec::new();
    let mut stack: Vec<(Id, Vec<Id>, usize)> = Vec::new();

    state.tcb_mut(root).explore_mark = generation;
    let root_edges = edges(state, root);
    stack.push((root, root_edges, 0));
    path.push(root);

    while let Some((_, node_edges, next)) = stack.last_mut() {
        if *next >= node_edges.len() {
            stack.pop();
            path.pop();
            continue;
        }
        let target = node_edges[*next];
        *next += 1;

        if let Some(pos) = path.iter().position(|&p| p == target) {
            cycles.push(path[pos..].to_vec());
            continue;
        }
        if state.tcb(target).map(|t| t.explore_mark) == Some(generation) {
            continue;
        }
        state.tcb_mut(target).explore_mark = generation;
        let target_edges = edges(state, target);
        stack.push((target, target_edges, 0));
        path.push(target);
    }
}

fn edges(state: &SchedState, id: Id) -> Vec<Id> {
    let tcb = match state.tcb(id) {
        Some(t) => t,
        None => return Vec::new(),
    };
    if let Some(target) = tcb.waiting_to_join {
        return vec![target];
    }
    if let Some(mutex) = tcb.waiting_mutex {
        return state
            .mutex(mutex)
            .and_then(|m| m.owner)
            .into_iter()
            .collect();
    }
    if let Some(cond) = tcb.waiting_cond {
        return state
            .not_finished
            .iter()
            .copied()
            .filter(|&other| {
                state
                    .tcb(other)
                    .map_or(false, |t| t.waiting_cond != Some(cond))
            })
            .collect();
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{CondCb, MutexCb};
    use crate::task::{Status, Tcb};

    fn id(n: u64) -> Id {
        Id::new(n).unwrap()
    }

    fn state_with_threads(n: usize) -> SchedState {
        let mut state = SchedState::new();
        for _ in 0..n {
            let tid = state.next_thread_id();
            state.insert_thread(Tcb::adopted(tid));
            state.not_finished.push(tid);
        }
        state
    }

    fn block_on_join(state: &mut SchedState, waiter: u64, target: u64) {
        let t = state.tcb_mut(id(waiter));
        t.status = Status::Waiting;
        t.waiting_to_join = Some(id(target));
        state.tcb_mut(id(target)).joined_by = Some(id(waiter));
    }

    fn block_on_mutex(state: &mut SchedState, waiter: u64, mutex: Id) {
        let t = state.tcb_mut(id(waiter));
        t.status = Status::Waiting;
        t.waiting_mutex = Some(mutex);
        state.mutex_mut(mutex).unwrap().waiters.push_back(id(waiter));
    }

    fn block_on_cond(state: &mut SchedState, waiter: u64, cond: Id) {
        let t = state.tcb_mut(id(waiter));
        t.status = Status::Waiting;
        t.waiting_cond = Some(cond);
        state.cond_mut(cond).unwrap().waiters.push_back(id(waiter));
    }

    fn cycle_sets(cycles: &[Vec<Id>]) -> Vec<std::collections::BTreeSet<Id>> {
        cycles.iter().map(|c| c.iter().copied().collect()).collect()
    }

    #[test]
    fn mutual_join_is_a_cycle() {
        let mut state = state_with_threads(2);
        block_on_join(&mut state, 1, 2);
        block_on_join(&mut state, 2, 1);
        let cycles = scan(&mut state);
        assert_eq!(
            cycle_sets(&cycles),
            vec![[id(1), id(2)].iter().copied().collect()]
        );
    }

    #[test]
    fn self_join_is_a_one_node_cycle() {
        let mut state = state_with_threads(1);
        block_on_join(&mut state, 1, 1);
        let cycles = scan(&mut state);
        assert_eq!(cycle_sets(&cycles), vec![[id(1)].iter().copied().collect()]);
    }

    #[test]
    fn mutex_ring_is_reported_with_all_members() {
        // Four threads, each owning one mutex and waiting for the next:
        // the classic lock-order ring.
        let mut state = state_with_threads(4);
        let mutexes: Vec<Id> = (0..4).map(|_| state.insert_mutex(MutexCb::new())).collect();
        for i in 0..4u64 {
            state.mutex_mut(mutexes[i as usize]).unwrap().owner = Some(id(i + 1));
        }
        for i in 0..4u64 {
            block_on_mutex(&mut state, i + 1, mutexes[((i + 1) % 4) as usize]);
        }
        let cycles = scan(&mut state);
        assert_eq!(
            cycle_sets(&cycles),
            vec![(1..=4).map(id).collect::<std::collections::BTreeSet<_>>()]
        );
    }

    #[test]
    fn waiting_on_an_ownerless_mutex_is_a_dead_end() {
        let mut state = state_with_threads(2);
        let m = state.insert_mutex(MutexCb::new());
        block_on_mutex(&mut state, 1, m);
        assert!(scan(&mut state).is_empty());
    }

    #[test]
    fn cond_wait_with_a_live_signaler_is_not_a_deadlock() {
        // Thread 2 is runnable and could still signal: the edge from 1
        // to 2 dead-ends there.
        let mut state = state_with_threads(2);
        let c = state.insert_cond(CondCb::new());
        block_on_cond(&mut state, 1, c);
        assert!(scan(&mut state).is_empty());
    }

    #[test]
    fn waiters_on_one_cond_have_no_edges_left() {
        // Every thread waits on the same variable: no potential signaler
        // remains, and no thread has an outgoing edge either. The scan
        // stays quiet; the empty-run-queue check is what turns this
        // situation fatal.
        let mut state = state_with_threads(3);
        let c = state.insert_cond(CondCb::new());
        for t in 1..=3 {
            block_on_cond(&mut state, t, c);
        }
        assert!(scan(&mut state).is_empty());
    }

    #[test]
    fn waiters_on_two_conds_close_a_cycle() {
        // Each thread is the only possible signaler of the other's
        // variable, so the cond edges run both ways and close a cycle.
        let mut state = state_with_threads(2);
        let c1 = state.insert_cond(CondCb::new());
        let c2 = state.insert_cond(CondCb::new());
        block_on_cond(&mut state, 1, c1);
        block_on_cond(&mut state, 2, c2);
        let cycles = scan(&mut state);
        assert_eq!(
            cycle_sets(&cycles),
            vec![[id(1), id(2)].iter().copied().collect()]
        );
    }

    #[test]
    fn cond_waiter_blocked_on_a_mutex_ring_member_is_reported() {
        // 1 and 2 hold each other's mutexes; 3 waits on a cond. 3 has
        // edges to both ring members, and the ring itself is a cycle.
        let mut state = state_with_threads(3);
        let m1 = state.insert_mutex(MutexCb::new());
        let m2 = state.insert_mutex(MutexCb::new());
        state.mutex_mut(m1).unwrap().owner = Some(id(1));
        state.mutex_mut(m2).unwrap().owner = Some(id(2));
        block_on_mutex(&mut state, 1, m2);
        block_on_mutex(&mut state, 2, m1);
        let c = state.insert_cond(CondCb::new());
        block_on_cond(&mut state, 3, c);
        let cycles = scan(&mut state);
        assert!(cycle_sets(&cycles).contains(&[id(1), id(2)].iter().copied().collect()));
    }

    #[test]
    fn finished_threads_are_not_potential_signalers() {
        // Thread 2 finished without being reaped. It can never signal, so
        // it contributes no cond edge and no cycle; the lone waiter is
        // left for the empty-run-queue check.
        let mut state = state_with_threads(2);
        state.tcb_mut(id(2)).status = Status::Finished;
        state.not_finished.retain(|&t| t != id(2));
        let c = state.insert_cond(CondCb::new());
        block_on_cond(&mut state, 1, c);
        assert!(scan(&mut state).is_empty());
    }

    #[test]
    fn repeated_scans_restamp_cleanly() {
        let mut state = state_with_threads(2);
        block_on_join(&mut state, 1, 2);
        block_on_join(&mut state, 2, 1);
        assert_eq!(scan(&mut state).len(), 1);
        assert_eq!(scan(&mut state).len(), 1);
    }
}
