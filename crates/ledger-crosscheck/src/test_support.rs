use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::auth::AuthProbe;
use crate::surface::Surface;

#[derive(Debug, Default)]
pub struct FakeSurface {
    pub navigated: usize,
    pub observed: usize,
    pub resets: usize,
    pub closed: bool,
    pub restored: Option<Value>,
    /// Number of upcoming `observe` calls that fail.
    pub failing_observes: usize,
}

#[async_trait::async_trait]
impl Surface for FakeSurface {
    async fn restore(&mut self, payload: &Value) -> Result<()> {
        self.restored = Some(payload.clone());
        Ok(())
    }

    async fn reset(&mut self) -> Result<()> {
        self.resets += 1;
        self.restored = None;
        Ok(())
    }

    async fn navigate(&mut self) -> Result<()> {
        self.navigated += 1;
        Ok(())
    }

    async fn observe(&mut self) -> Result<()> {
        self.observed += 1;
        if self.failing_observes > 0 {
            self.failing_observes -= 1;
            return Err(anyhow!("page is navigating"));
        }
        Ok(())
    }

    async fn export(&self) -> Result<Value> {
        Ok(json!({"cookies": {"sid": "fake"}}))
    }

    fn manual_login_hint(&self) -> String {
        "log in to the fake site".to_owned()
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Answers the logged-in probe from a queue; an exhausted queue answers `false`.
#[derive(Default)]
pub struct ScriptedProbe {
    answers: Mutex<VecDeque<Result<bool, &'static str>>>,
    login_marker: bool,
    hang: Option<Duration>,
    pub calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        ScriptedProbe::default()
    }

    pub fn logged_in(self, answers: impl IntoIterator<Item = Result<bool, &'static str>>) -> Self {
        self.answers.lock().unwrap().extend(answers);
        self
    }

    pub fn login_marker(mut self, present: bool) -> Self {
        self.login_marker = present;
        self
    }

    pub fn hang_for(mut self, duration: Duration) -> Self {
        self.hang = Some(duration);
        self
    }
}

#[async_trait::async_trait]
impl AuthProbe<FakeSurface> for ScriptedProbe {
    async fn authenticated(&self, _surface: &mut FakeSurface) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hang) = self.hang {
            tokio::time::sleep(hang).await;
        }
        let answer = self.answers.lock().unwrap().pop_front();
        match answer {
            Some(Ok(found)) => Ok(found),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Ok(false),
        }
    }

    async fn unauthenticated(&self, _surface: &mut FakeSurface) -> Result<bool> {
        if let Some(hang) = self.hang {
            tokio::time::sleep(hang).await;
        }
        Ok(self.login_marker)
    }
}
