// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod ca;
pub mod cert;
pub mod commands;
pub mod config;
pub mod db;
pub mod seal;
pub mod secret_reader;
