/*!

This is the long-form manual for `legislative_tally` and `escrutinio`.

## Slots

A station elects `seatCount` deputies among `partyCount` parties. Every party
owns `seatCount` consecutive slots, in ballot order and starting at 1:

| seats | parties | ranges                              |
|-------|---------|-------------------------------------|
| 8     | 5       | `1-8, 9-16, 17-24, 25-32, 33-40`    |
| 3     | 2       | `1-3, 4-6`                          |

A vote target is written `party/slot`, for instance `libre/9`. A mark on a
slot outside the range of its party is rejected.

## Papeletas

Exactly one papeleta is open at a time. Toggling a slot marks it, or unmarks
it when it is already marked; at most `seatCount` slots can be marked. Every
accepted toggle is applied to the running totals immediately.

- *closing* keeps the marks and opens the next papeleta. A papeleta closed
  with every seat marked counts as a completed ballot; a partial one is
  accepted but does not.
- *annulling* removes all its marks from the totals again and records the
  reason.

Closed and annulled papeletas cannot be modified.

## Session lifecycle

| from        | to          | operation                         |
|-------------|-------------|-----------------------------------|
| PENDING     | IN_PROGRESS | first mark, or `start`            |
| IN_PROGRESS | CLOSED      | `freeze` (FREEZE checkpoint)      |
| CLOSED      | IN_PROGRESS | `unfreeze` (UNFREEZE checkpoint)  |
| CLOSED      | COMPLETED   | `finalize`                        |
| COMPLETED   | CLOSED      | `reopen`                          |

Marks and papeleta operations are only accepted in PENDING and IN_PROGRESS.

`freeze` pauses the synchronization, waits up to the drain delay for an
update in flight, snapshots the local totals and asks for a position fix
(bounded by the geolocation timeout). When no fix is available the
checkpoint is recorded without coordinates. A checkpoint only enters the log
once the checkpoint transport acknowledged it. Each checkpoint carries the
SHA-256 digest of the previous one; see [`crate::checkpoint::verify_chain`].

`finalize` needs a photo of the tally sheet, the reference of an earlier
upload, or an explicit override. It then waits for every count update to
reach the remote store (bounded by the flush timeout) and hands the final
tally to the submitter. If any of these steps fails the session stays
CLOSED.

## Synchronization

Count updates are applied locally first and replayed against the remote
store by a background task, in issue order. A failing remote is retried
with jittered exponential backoff, without ever dropping an update. Each
update carries a unique id so that a remote can ignore duplicates.

## Local state

After every change the session saves a record through its
[`crate::persistence::LocalPersistence`] backend:

```json
{
  "version": 3,
  "sessionId": "hn-0142-diputados",
  "state": {
    "currentPapeleta": 12,
    "expandedParty": "libre",
    "bufferMarks": ["pdc/1", "libre/9"],
    "completedCount": 7,
    "annulledCount": 1,
    "status": "IN_PROGRESS",
    "pendingSync": [],
    "checkpoints": []
  }
}
```

Opening the same session again resumes from this record, including the
count updates that never reached the remote store and the status, which
wins over the status service when a change was never published. A record
whose checkpoint log ends in FREEZE always resumes CLOSED. Opening another
session drops the record, unless it still holds unsynchronized updates.
Version 2 records lack `status`. Records without a `version` field are the
older flat layout, with marks stored as `{"pdc_1": 1}`; both are converted
when read.

## The `escrutinio` program

`escrutinio` replays a transcription log for one station through the core,
using files in a state directory in place of the remote services.

```bash
escrutinio --config station.json --reference expected_summary.json
```

### Configuration

```json
{
  "sessionId": "hn-0142-diputados",
  "station": { "name": "JRV 0142", "department": "Francisco Morazan" },
  "seatCount": 8,
  "parties": ["pdc", "libre", "pn", "pinu", "pl"],
  "actingUser": "ana",
  "actionSources": [{ "provider": "csv", "filePath": "actions.csv" }],
  "gps": { "latitude": 14.0818, "longitude": -87.2068, "accuracy": 8.0 },
  "timing": { "drainDelayMs": 200, "flushTimeoutMs": 5000 }
}
```

`gps` and `timing` are optional. File paths are relative to the
configuration file.

### `csv`

```text
action,party,slot,user,value
mark,pdc,1,,
mark,libre,9,,
close,,,,
annul,,,,torn page
freeze,,,ana,
finalize,,,ana,override
```

Actions: `start`, `mark`, `close`, `annul` (value: reason), `expand` (party,
or empty to collapse), `freeze`, `unfreeze`, `finalize` (value: `override`,
`photo:<file>` or an evidence reference) and `reopen`. The `user` column
defaults to `actingUser`.

### `json`

The same actions as a JSON array:

```json
[
  { "action": "mark", "party": "pdc", "slot": 1 },
  { "action": "close" },
  { "action": "finalize", "value": "override" }
]
```

A rejected action (for example a mark beyond the seat limit) is logged and
counted in the summary; the replay continues with the next action.

 */
