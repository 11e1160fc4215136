//! Lookahead question/answer cache with compute-once coordination.
//!
//! Wraps an iterator of questions so that repeats of a question coming up
//! soon can be served from cache, and so that several worker threads never
//! compute the same answer twice.  At most `lookahead` unconsumed questions
//! are materialized at a time; a per-question reference count tracks how many
//! appearances are still outstanding, and an answer is only retained while
//! its question is still referenced — so live answers are bounded by the
//! lookahead window, not by the stream length.
//!
//! Computing one answer may produce further question/answer pairs as a
//! byproduct (decoding a compound block yields every segment in it).  A
//! worker that claims a question also claims its byproduct questions that are
//! in the window, blocking sibling workers from redundantly repeating the
//! same decode; when the claimant finishes, it installs and delivers all of
//! them at once.
//!
//! The intended per-question workflow, with all calls made exactly once:
//!
//! ```text
//! for q in cache.iter_questions(src)? {
//!     match cache.consume_cached_answer(&q)? {
//!         Some(a) => use(a),
//!         None => if cache.i_should_compute(&q, &byproducts) {
//!             let (a, byproduct_qas) = compute(&q);
//!             cache.i_have_computed(&q, a, byproduct_qas)?;
//!         } else {
//!             // another thread is on it
//!             cache.put_answer_when_ready(&q, slot)?;  // or wait_for_answer(&q)
//!         },
//!     }
//! }
//! cache.finished()?;
//! ```
//!
//! The reference counting depends on that shape; skipping or repeating calls
//! surfaces as a [`WorkflowError`], which always means a bug in the caller,
//! never bad input data.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

use crate::pipeline::{local_slot, OutputSlot};

/// Default bound on materialized-but-unconsumed questions.
pub const DEFAULT_LOOKAHEAD: usize = 1000;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("question reference count underflow")]
    RefcountUnderflow,
    #[error("attempt to iterate a QA cache twice")]
    DoubleIteration,
    #[error("answer delivery requested for a question nobody has claimed")]
    NoClaim,
    #[error("waiter abandoned before an answer was delivered")]
    WaiterAborted,
    #[error("finished with {0} still populated")]
    Leak(&'static str),
}

// ── State ────────────────────────────────────────────────────────────────────

struct State<Q, A> {
    pending: VecDeque<Q>,
    refcnt: HashMap<Q, usize>,
    answers: HashMap<Q, A>,
    /// Question → waiter sinks, present while some worker has claimed it.
    claims: HashMap<Q, Vec<OutputSlot<A>>>,
    iterating: bool,
}

impl<Q: Eq + Hash + Clone, A: Clone> State<Q, A> {
    fn dec_refcnt(&mut self, q: &Q) -> Result<(), WorkflowError> {
        let count = self.refcnt.get_mut(q).ok_or(WorkflowError::RefcountUnderflow)?;
        *count -= 1;
        if *count == 0 {
            self.refcnt.remove(q);
            self.answers.remove(q);
        }
        Ok(())
    }
}

// ── Cache handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to one shared cache; every operation is atomic under a
/// single mutex.  The mutex is never held across the caller's heavyweight
/// work — only across the bookkeeping calls themselves.
pub struct QaCache<Q, A> {
    state: Arc<Mutex<State<Q, A>>>,
    lookahead: usize,
}

impl<Q, A> Clone for QaCache<Q, A> {
    fn clone(&self) -> Self {
        QaCache { state: Arc::clone(&self.state), lookahead: self.lookahead }
    }
}

impl<Q: Eq + Hash + Clone, A: Clone> QaCache<Q, A> {
    pub fn new(lookahead: usize) -> QaCache<Q, A> {
        QaCache {
            state: Arc::new(Mutex::new(State {
                pending: VecDeque::new(),
                refcnt: HashMap::new(),
                answers: HashMap::new(),
                claims: HashMap::new(),
                iterating: false,
            })),
            lookahead,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<Q, A>> {
        self.state.lock().expect("qa cache mutex poisoned")
    }

    /// Wrap the question source.  Only one iteration per cache is permitted.
    pub fn iter_questions<I>(&self, src: I) -> Result<QaIter<A, I>, WorkflowError>
    where
        I: Iterator<Item = Q>,
    {
        let mut st = self.lock();
        if st.iterating {
            return Err(WorkflowError::DoubleIteration);
        }
        st.iterating = true;
        drop(st);
        Ok(QaIter { cache: self.clone(), src, primed: false })
    }

    /// If an answer for `q` is cached, consume this appearance of `q` and
    /// return it; otherwise leave the appearance outstanding.
    pub fn consume_cached_answer(&self, q: &Q) -> Result<Option<A>, WorkflowError> {
        let mut st = self.lock();
        match st.answers.get(q).cloned() {
            Some(answer) => {
                st.dec_refcnt(q)?;
                Ok(Some(answer))
            }
            None => Ok(None),
        }
    }

    /// Ask for the right to compute `q`.  On `true`, `q` and every byproduct
    /// question that is in the window, unanswered, and unclaimed are claimed
    /// for this caller, which must follow up with [`i_have_computed`].  On
    /// `false`, another worker already answered or claimed `q`.
    ///
    /// [`i_have_computed`]: QaCache::i_have_computed
    pub fn i_should_compute(&self, q: &Q, byproducts: &[Q]) -> bool {
        let mut st = self.lock();
        if st.answers.contains_key(q) || st.claims.contains_key(q) {
            return false;
        }
        for question in std::iter::once(q).chain(byproducts) {
            if st.refcnt.contains_key(question)
                && !st.answers.contains_key(question)
                && !st.claims.contains_key(question)
            {
                st.claims.insert(question.clone(), Vec::new());
            }
        }
        true
    }

    /// Complete a claim: consume this appearance of `q`, install the answers
    /// that are still referenced, and deliver to every registered waiter.
    pub fn i_have_computed(
        &self,
        q: &Q,
        answer: A,
        byproduct_qas: Vec<(Q, A)>,
    ) -> Result<(), WorkflowError> {
        let mut st = self.lock();
        st.dec_refcnt(q)?;
        let mut deliveries = Vec::with_capacity(1 + byproduct_qas.len());
        deliveries.push((q.clone(), answer));
        deliveries.extend(byproduct_qas);
        for (question, answer) in deliveries {
            if st.refcnt.contains_key(&question) {
                st.answers.insert(question.clone(), answer.clone());
            }
            if let Some(waiters) = st.claims.remove(&question) {
                for slot in waiters {
                    slot.deposit(answer.clone());
                    st.dec_refcnt(&question)?;
                }
            }
        }
        Ok(())
    }

    /// Deliver `q`'s answer into `slot` — immediately if it is already
    /// cached, otherwise when the claimant completes.  Consumes this
    /// appearance of `q` either way.
    pub fn put_answer_when_ready(&self, q: &Q, slot: OutputSlot<A>) -> Result<(), WorkflowError> {
        let mut st = self.lock();
        match st.answers.get(q).cloned() {
            Some(answer) => {
                slot.deposit(answer);
                st.dec_refcnt(q)
            }
            None => {
                st.claims.get_mut(q).ok_or(WorkflowError::NoClaim)?.push(slot);
                Ok(())
            }
        }
    }

    /// Blocking variant of [`put_answer_when_ready`].
    ///
    /// [`put_answer_when_ready`]: QaCache::put_answer_when_ready
    pub fn wait_for_answer(&self, q: &Q) -> Result<A, WorkflowError> {
        let (slot, rx) = local_slot();
        self.put_answer_when_ready(q, slot)?;
        match rx.recv() {
            Ok(Some(answer)) => Ok(answer),
            _ => Err(WorkflowError::WaiterAborted),
        }
    }

    /// Invariant check after a complete run: nothing may be left behind.
    pub fn finished(&self) -> Result<(), WorkflowError> {
        let st = self.lock();
        if !st.pending.is_empty() {
            Err(WorkflowError::Leak("the lookahead queue"))
        } else if !st.refcnt.is_empty() {
            Err(WorkflowError::Leak("question references"))
        } else if !st.answers.is_empty() {
            Err(WorkflowError::Leak("cached answers"))
        } else if !st.claims.is_empty() {
            Err(WorkflowError::Leak("claims"))
        } else {
            Ok(())
        }
    }

    fn push(&self, q: Q) {
        let mut st = self.lock();
        *st.refcnt.entry(q.clone()).or_insert(0) += 1;
        st.pending.push_back(q);
    }

    fn pop_front(&self) -> Option<Q> {
        self.lock().pending.pop_front()
    }
}

// ── Iterator ─────────────────────────────────────────────────────────────────

/// The single permitted iteration over a cache's question source: prefills
/// the lookahead window, then yields the oldest question as each new one is
/// materialized, and drains the window once the source is exhausted.
pub struct QaIter<A, I: Iterator> {
    cache: QaCache<I::Item, A>,
    src: I,
    primed: bool,
}

impl<A, I> Iterator for QaIter<A, I>
where
    I: Iterator,
    I::Item: Eq + Hash + Clone,
    A: Clone,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            for _ in 0..self.cache.lookahead {
                match self.src.next() {
                    Some(q) => self.cache.push(q),
                    None => break,
                }
            }
        }
        match self.src.next() {
            Some(q) => {
                self.cache.push(q);
                self.cache.pop_front()
            }
            None => self.cache.pop_front(),
        }
    }
}
