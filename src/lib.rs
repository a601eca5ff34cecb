// Copyright 2023 CoreOS, Inc.
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

pub mod agent;
pub mod cmdline;
pub mod controller;
pub mod cpio;
pub mod dict;
pub mod errors;
pub mod handler;
pub mod installer;
pub mod io;
pub mod ipc;
pub mod manifest;
pub mod notify;
pub mod progress;
pub mod state;
pub mod supervisor;
pub mod verify;
pub mod version;
