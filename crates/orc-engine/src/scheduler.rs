//! Scheduler — fires `TimeTrigger` descriptors at matching wall-clock
//! moments (UTC), synthesizing an internal event.

use orc_shared::model::CronExpr;
use std::collections::HashMap;

/// Tracks, per descriptor, the next UTC instant its cron expression fires,
/// advancing as ticks consume due firings.
#[derive(Default)]
pub struct Scheduler {
    next_fire: HashMap<String, chrono::DateTime<chrono::Utc>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) a descriptor's cron expression.
    pub fn register(&mut self, descriptor_id: &str, cron: &CronExpr) {
        if let Some(next) = cron.schedule().upcoming(chrono::Utc).next() {
            self.next_fire.insert(descriptor_id.to_string(), next);
        }
    }

    pub fn unregister(&mut self, descriptor_id: &str) {
        self.next_fire.remove(descriptor_id);
    }

    /// Descriptor ids whose next fire time has passed `now`; advances each
    /// fired descriptor to its following occurrence.
    pub fn due(&mut self, now: chrono::DateTime<chrono::Utc>, crons: &HashMap<String, CronExpr>) -> Vec<String> {
        let mut fired = Vec::new();
        for (id, next) in self.next_fire.clone() {
            if next <= now {
                fired.push(id.clone());
                // Catch up to the first occurrence strictly after `now`, not
                // just after `next` — otherwise a scheduler that was asleep
                // past several occurrences re-fires all of them at once.
                if let Some(cron) = crons.get(&id) {
                    if let Some(following) = cron.schedule().after(&now).next() {
                        self.next_fire.insert(id, following);
                    }
                }
            }
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_fires_past_moments_and_advances() {
        let mut scheduler = Scheduler::new();
        let cron = CronExpr::parse("* * * * *").unwrap();
        let mut crons = HashMap::new();
        crons.insert("wf".to_string(), cron.clone());
        scheduler.register("wf", &cron);

        let far_future = chrono::Utc::now() + chrono::Duration::days(400);
        let fired = scheduler.due(far_future, &crons);
        assert_eq!(fired, vec!["wf".to_string()]);

        // Advanced past `far_future`; immediately re-checking the same
        // instant must not fire again.
        let fired_again = scheduler.due(far_future, &crons);
        assert!(fired_again.is_empty());
    }

    #[test]
    fn unregister_stops_future_firings() {
        let mut scheduler = Scheduler::new();
        let cron = CronExpr::parse("* * * * *").unwrap();
        let mut crons = HashMap::new();
        crons.insert("wf".to_string(), cron.clone());
        scheduler.register("wf", &cron);
        scheduler.unregister("wf");
        let fired = scheduler.due(chrono::Utc::now() + chrono::Duration::days(400), &crons);
        assert!(fired.is_empty());
    }
}
