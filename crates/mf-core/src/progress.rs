/// Step counter used for periodic progress logging
pub struct ProgressTracker {
    pub current_step: usize,
    pub total_steps: usize,
    pub message: String,
    log_every: usize,
}

impl ProgressTracker {
    pub fn new(total_steps: usize) -> Self {
        Self {
            current_step: 0,
            total_steps,
            message: String::new(),
            log_every: (total_steps / 20).max(1),
        }
    }

    /// Resume counting from `step`
    pub fn starting_at(mut self, step: usize) -> Self {
        self.current_step = step;
        self
    }

    pub fn progress(&self) -> f32 {
        if self.total_steps == 0 {
            1.0
        } else {
            self.current_step as f32 / self.total_steps as f32
        }
    }

    pub fn is_done(&self) -> bool {
        self.current_step >= self.total_steps
    }

    /// Advance one step; logs at roughly every 5% and on the last step.
    pub fn step(&mut self, message: impl Into<String>) {
        self.current_step += 1;
        self.message = message.into();
        if self.current_step % self.log_every == 0 || self.is_done() {
            log::info!(
                "[{}/{} {:>5.1}%] {}",
                self.current_step,
                self.total_steps,
                self.progress() * 100.0,
                self.message
            );
        }
    }
}
