// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tokio::sync::broadcast;
use tracing::debug;

/// Fans a single shutdown signal out to every background task of a
/// partition.
#[derive(Debug, Clone)]
pub struct ShutdownNotifier {
    sender: broadcast::Sender<()>,
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1);
        ShutdownNotifier { sender }
    }
}

impl ShutdownNotifier {
    pub fn subscribe(&self) -> Shutdown {
        Shutdown::new(self.sender.subscribe())
    }

    pub fn notify(&self) {
        // nobody listening is fine
        let receivers = self.sender.send(()).unwrap_or(0);
        debug!("shutdown sent to {} tasks", receivers);
    }
}

#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Resolves once shutdown was signalled, or the notifier is gone.
    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
