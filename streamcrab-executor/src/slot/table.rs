use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Reserved for a job; must be activated before its deadline.
    Allocated,
    /// Accepts deployments.
    Active,
}

struct TaskSlot<T> {
    index: usize,
    job_id: JobId,
    allocation_id: AllocationId,
    state: SlotState,
    deadline: Instant,
    tasks: HashMap<ExecutionAttemptId, Arc<T>>,
}

/// Fixed number of slots, each holding at most one allocation and the tasks
/// deployed into it.
///
/// Not synchronized; the owner wraps it in a lock.
pub struct TaskSlotTable<T> {
    slots: Vec<Option<TaskSlot<T>>>,
    allocations: HashMap<AllocationId, usize>,
    attempts: HashMap<ExecutionAttemptId, AllocationId>,
}

impl<T> TaskSlotTable<T> {
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: (0..num_slots).map(|_| None).collect(),
            allocations: HashMap::new(),
            attempts: HashMap::new(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Reserve slot `index` for `allocation_id` of `job_id`. Allocating the same
    /// allocation to the same slot again only refreshes the timeout.
    pub fn allocate_slot(
        &mut self,
        index: usize,
        job_id: JobId,
        allocation_id: AllocationId,
        timeout: Duration,
    ) -> Result<(), SlotError> {
        let num_slots = self.slots.len();
        let deadline = Instant::now() + timeout;
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(SlotError::UnknownSlot { index, num_slots })?;

        match slot {
            Some(existing) if existing.allocation_id == allocation_id => {
                if existing.job_id != job_id {
                    return Err(SlotError::JobMismatch {
                        allocation_id,
                        expected: job_id,
                        actual: existing.job_id,
                    });
                }
                if existing.state == SlotState::Allocated {
                    existing.deadline = deadline;
                }
                Ok(())
            }
            Some(existing) => Err(SlotError::SlotOccupied {
                index,
                allocation_id: existing.allocation_id,
            }),
            None => {
                if let Some(other) = self.allocations.get(&allocation_id) {
                    return Err(SlotError::SlotOccupied {
                        index: *other,
                        allocation_id,
                    });
                }
                *slot = Some(TaskSlot {
                    index,
                    job_id,
                    allocation_id,
                    state: SlotState::Allocated,
                    deadline,
                    tasks: HashMap::new(),
                });
                self.allocations.insert(allocation_id, index);
                tracing::info!("allocated slot {index} for {job_id} ({allocation_id})");
                Ok(())
            }
        }
    }

    /// Activate the slot of `allocation_id`. An allocation whose timeout passed
    /// is freed instead.
    pub fn mark_slot_active(&mut self, allocation_id: AllocationId) -> Result<(), SlotError> {
        self.mark_slot_active_at(allocation_id, Instant::now())
    }

    pub fn mark_slot_active_at(
        &mut self,
        allocation_id: AllocationId,
        now: Instant,
    ) -> Result<(), SlotError> {
        let slot = self.slot_mut(allocation_id)?;
        match slot.state {
            SlotState::Active => Ok(()),
            SlotState::Allocated if now >= slot.deadline => {
                self.free_slot(allocation_id);
                tracing::warn!("allocation {allocation_id} expired before activation");
                Err(SlotError::AllocationExpired { allocation_id })
            }
            SlotState::Allocated => {
                slot.state = SlotState::Active;
                Ok(())
            }
        }
    }

    /// Free every allocated (not active) slot whose timeout passed.
    pub fn free_expired_slots(&mut self, now: Instant) -> Vec<AllocationId> {
        let expired: Vec<AllocationId> = self
            .slots
            .iter()
            .flatten()
            .filter(|slot| slot.state == SlotState::Allocated && now >= slot.deadline)
            .map(|slot| slot.allocation_id)
            .collect();
        for allocation_id in &expired {
            tracing::info!("freeing slot of {allocation_id}: allocation timed out");
            self.free_slot(*allocation_id);
        }
        expired
    }

    /// The guard in front of every deployment: `allocation_id` must name an
    /// active slot owned by `job_id`.
    pub fn verify_allocation(
        &self,
        job_id: JobId,
        allocation_id: AllocationId,
    ) -> Result<(), SlotError> {
        let slot = self.slot(allocation_id)?;
        if slot.job_id != job_id {
            return Err(SlotError::JobMismatch {
                allocation_id,
                expected: job_id,
                actual: slot.job_id,
            });
        }
        if slot.state != SlotState::Active {
            return Err(SlotError::SlotNotActive { allocation_id });
        }
        Ok(())
    }

    pub fn slot_state(&self, allocation_id: AllocationId) -> Option<SlotState> {
        self.slot(allocation_id).ok().map(|slot| slot.state)
    }

    pub fn owning_job(&self, allocation_id: AllocationId) -> Option<JobId> {
        self.slot(allocation_id).ok().map(|slot| slot.job_id)
    }

    pub fn slot_index(&self, allocation_id: AllocationId) -> Option<usize> {
        self.slot(allocation_id).ok().map(|slot| slot.index)
    }

    /// Release the slot and hand back the tasks that were still in it.
    pub fn free_slot(&mut self, allocation_id: AllocationId) -> Vec<Arc<T>> {
        let Some(index) = self.allocations.remove(&allocation_id) else {
            return Vec::new();
        };
        let Some(slot) = self.slots.get_mut(index).and_then(Option::take) else {
            return Vec::new();
        };
        let mut tasks = Vec::with_capacity(slot.tasks.len());
        for (attempt_id, task) in slot.tasks {
            self.attempts.remove(&attempt_id);
            tasks.push(task);
        }
        tracing::info!("freed slot {index} ({allocation_id})");
        tasks
    }

    pub fn add_task(
        &mut self,
        job_id: JobId,
        allocation_id: AllocationId,
        attempt_id: ExecutionAttemptId,
        task: Arc<T>,
    ) -> Result<(), SlotError> {
        self.verify_allocation(job_id, allocation_id)?;
        if self.attempts.contains_key(&attempt_id) {
            return Err(SlotError::DuplicateAttempt { attempt_id });
        }
        self.slot_mut(allocation_id)?.tasks.insert(attempt_id, task);
        self.attempts.insert(attempt_id, allocation_id);
        Ok(())
    }

    pub fn remove_task(&mut self, attempt_id: ExecutionAttemptId) -> Option<Arc<T>> {
        let allocation_id = self.attempts.remove(&attempt_id)?;
        self.slot_mut(allocation_id).ok()?.tasks.remove(&attempt_id)
    }

    pub fn get_task(&self, attempt_id: ExecutionAttemptId) -> Option<Arc<T>> {
        let allocation_id = self.attempts.get(&attempt_id)?;
        self.slot(*allocation_id)
            .ok()?
            .tasks
            .get(&attempt_id)
            .map(Arc::clone)
    }

    pub fn tasks(&self, allocation_id: AllocationId) -> Vec<Arc<T>> {
        self.slot(allocation_id)
            .map(|slot| slot.tasks.values().map(Arc::clone).collect())
            .unwrap_or_default()
    }

    pub fn all_tasks(&self) -> Vec<Arc<T>> {
        self.slots
            .iter()
            .flatten()
            .flat_map(|slot| slot.tasks.values().map(Arc::clone))
            .collect()
    }

    fn slot(&self, allocation_id: AllocationId) -> Result<&TaskSlot<T>, SlotError> {
        self.allocations
            .get(&allocation_id)
            .and_then(|index| self.slots.get(*index))
            .and_then(Option::as_ref)
            .ok_or(SlotError::AllocationMismatch { allocation_id })
    }

    fn slot_mut(&mut self, allocation_id: AllocationId) -> Result<&mut TaskSlot<T>, SlotError> {
        self.allocations
            .get(&allocation_id)
            .and_then(|index| self.slots.get_mut(*index))
            .and_then(Option::as_mut)
            .ok_or(SlotError::AllocationMismatch { allocation_id })
    }
}
